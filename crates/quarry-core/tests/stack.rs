//! Stack unwinding across frames, inlined calls and stack switches

mod common;

use std::sync::Arc;

use common::FakeMemory;
use quarry_core::binary::{
    BinaryInfo, BinaryInfoBuilder, Function, InlinedCall, StructField, Type, TypeId, TypeKind,
};
use quarry_core::error::QuarryError;
use quarry_core::eval::{EvalScope, Variable};
use quarry_core::frame::{FrameContext, FrameRule, FrameTable};
use quarry_core::memory::Memory;
use quarry_core::stack::{thread_stacktrace, StackIterator, Stackframe, TaskContext};
use quarry_core::types::{Address, Architecture, DwarfRegisters, Registers};

const ARCH: Architecture = Architecture::X86_64;

const STACK: u64 = 0xc000_e000;
const G_ADDR: u64 = 0xc000_0000;
const M_ADDR: u64 = 0xc000_1000;
const G0_ADDR: u64 = 0xc000_2000;
const REASON_ADDR: u64 = 0xc000_3000;
const STACK_LO: u64 = 0xc000_8000;
const STACK_HI: u64 = 0xc001_0000;
/// Goroutine stack pointer used by the stack switch tests
const G_SP: u64 = 0xc000_f000;
/// System stack pointer
const SYS_SP: u64 = 0x7000_0000;

fn sp_frame(size: i64) -> FrameContext
{
    let pc = ARCH.pc_register();
    FrameContext::new(
        FrameRule::Cfa {
            register: ARCH.sp_register(),
            offset: size,
        },
        pc,
    )
    .with_rule(pc, FrameRule::Offset(-8))
}

struct Program
{
    bi: Arc<BinaryInfo>,
    g: TypeId,
}

fn program() -> Program
{
    common::init_tracing();
    let functions = [
        ("main.c", 0x1000, 0x1100),
        ("main.b", 0x1100, 0x1200),
        ("runtime.goexit", 0x1300, 0x1400),
        ("runtime.gopark", 0x1400, 0x1500),
        ("runtime.asmcgocall", 0x1500, 0x1600),
        ("runtime.cgocall", 0x1600, 0x1700),
        ("main.callback", 0x1700, 0x1800),
        ("runtime.cgocallback_gofunc", 0x1800, 0x1900),
        ("_cgo_work", 0x3000, 0x3100),
        ("_cgo_callback", 0x3100, 0x3200),
    ];

    let mut frames = FrameTable::new();
    let mut builder = BinaryInfoBuilder::new(ARCH);
    for (name, entry, end) in functions {
        let size = if name == "runtime.cgocall" { 32 } else { 16 };
        frames.add(entry, end, sp_frame(size));
        builder = builder.function(Function::new(name, entry, end));
    }
    frames.add(0x1200, 0x1300, sp_frame(16));
    builder = builder.function(
        Function::new("main.main", 0x1200, 0x1300)
            .with_inlined_call(InlinedCall::new("main.inl", 0x1240..0x1260, "main.go", 12)),
    );

    let g = goroutine_type(&builder);
    Program {
        bi: Arc::new(builder.frames(frames).build()),
        g,
    }
}

/// `runtime.g`, trimmed to the fields goroutine contexts read.
fn goroutine_type(builder: &BinaryInfoBuilder) -> TypeId
{
    let types = builder.types();
    let uintptr = types.basic("uintptr", 8, TypeKind::Uint);
    let uint32 = types.basic("uint32", 4, TypeKind::Uint);
    let int64 = types.basic("int64", 8, TypeKind::Int);
    let string = types.string_type();

    let g = types.reserve("runtime.g");
    let m = types.add(Type::new(
        "runtime.m",
        8,
        TypeKind::Struct(vec![StructField::new("g0", types.pointer_to(g), 0)]),
    ));
    let stack = types.add(Type::new(
        "runtime.stack",
        16,
        TypeKind::Struct(vec![StructField::new("lo", uintptr, 0), StructField::new("hi", uintptr, 8)]),
    ));
    let gobuf = types.add(Type::new(
        "runtime.gobuf",
        24,
        TypeKind::Struct(vec![
            StructField::new("sp", uintptr, 0),
            StructField::new("pc", uintptr, 8),
            StructField::new("bp", uintptr, 16),
        ]),
    ));
    types.define(
        g,
        Type::new(
            "runtime.g",
            88,
            TypeKind::Struct(vec![
                StructField::new("stack", stack, 0),
                StructField::new("sched", gobuf, 16),
                StructField::new("m", types.pointer_to(m), 40),
                StructField::new("atomicstatus", uint32, 48),
                StructField::new("goid", int64, 56),
                StructField::new("gopc", uintptr, 64),
                StructField::new("waitreason", string, 72),
            ]),
        ),
    );
    g
}

/// A goroutine parked in `runtime.gopark` on the goroutine stack, whose
/// thread's `g0` saved [`SYS_SP`].
fn with_goroutine(mem: FakeMemory) -> FakeMemory
{
    mem.with_words(
        G_ADDR,
        &[STACK_LO, STACK_HI, G_SP, 0x1410, 0, M_ADDR, 4, 7, 0x1020, REASON_ADDR, 5],
    )
    .with_words(M_ADDR, &[G0_ADDR])
    .with_words(G0_ADDR, &[0, 0, SYS_SP])
    .with(REASON_ADDR, b"sleep".to_vec())
}

fn parse_task(program: &Program, mem: &Memory) -> TaskContext
{
    let g = Variable::new("g", Address::new(G_ADDR), program.g, Arc::clone(mem), Arc::clone(&program.bi));
    TaskContext::parse(&g).unwrap()
}

fn names(frames: &[Stackframe]) -> Vec<&str>
{
    frames
        .iter()
        .map(|frame| frame.current.function_name().unwrap_or("?"))
        .collect()
}

#[test]
fn test_caller_frames_start_at_return_addresses()
{
    let program = program();
    let (_, mem) = FakeMemory::new()
        .with_words(STACK, &[0, 0x1150, 0, 0x1280, 0, 0x1310, 0, 0])
        .shared();
    let mut snapshot = Registers::new(ARCH);
    snapshot.pc = Address::new(0x1010);
    snapshot.sp = Address::new(STACK);
    let regs = DwarfRegisters::from(&snapshot);

    let mut it = StackIterator::new(Arc::clone(&program.bi), Arc::clone(&mem), regs.clone(), None);
    let frames = it.stacktrace(10).unwrap();
    assert!(it.err().is_none());
    assert_eq!(names(&frames), ["main.c", "main.b", "main.main", "runtime.goexit"]);

    for pair in frames.windows(2) {
        let (callee, caller) = (&pair[0], &pair[1]);
        assert_eq!(caller.current.pc, Address::new(callee.ret));
        assert_eq!(caller.call.pc, caller.current.pc);
        assert_eq!(caller.last_pc(), callee.ret - 1);
        assert_eq!(caller.regs.cfa, callee.regs.cfa + 16);
    }
    assert_eq!(frames[0].regs.cfa, (STACK + 16) as i64);
    assert_eq!(frames[0].return_address_slot(), STACK + 8);
    // Without a goroutine the walk is on the system stack
    assert_eq!(frames[0].frame_offset(), (STACK + 16) as i64);
    assert!(frames.iter().all(|frame| frame.err.is_none()));

    let scope = EvalScope::thread(Arc::clone(&program.bi), mem, regs, None).unwrap();
    assert_eq!(scope.location.function_name(), Some("main.c"));
}

#[test]
fn test_depth_limits_frames()
{
    let program = program();
    let (_, mem) = FakeMemory::new()
        .with_words(STACK, &[0, 0x1150, 0, 0x1280, 0, 0x1310, 0, 0])
        .shared();
    let regs = DwarfRegisters::with_frame(ARCH, 0x1010, STACK, 0);

    let frames = thread_stacktrace(Arc::clone(&program.bi), Arc::clone(&mem), regs.clone(), None, 1).unwrap();
    assert_eq!(names(&frames), ["main.c", "main.b"]);

    let frames = thread_stacktrace(Arc::clone(&program.bi), mem, regs, None, 0).unwrap();
    assert_eq!(frames.len(), 1);
}

#[test]
fn test_read_failure_ends_with_sentinel()
{
    let program = program();
    // main.b's return address slot is unmapped
    let (_, mem) = FakeMemory::new().with_words(STACK, &[0, 0x1150]).shared();
    let regs = DwarfRegisters::with_frame(ARCH, 0x1010, STACK, 0);

    let frames = StackIterator::new(Arc::clone(&program.bi), mem, regs, None)
        .stacktrace(10)
        .unwrap();
    assert_eq!(frames.len(), 3);
    assert_eq!(names(&frames[..2]), ["main.c", "main.b"]);
    assert!(frames[..2].iter().all(|frame| frame.err.is_none()));
    assert!(matches!(
        frames[2].err,
        Some(QuarryError::MemoryRead { address, .. }) if address == STACK + 0x18
    ));
}

#[test]
fn test_inlined_calls_get_their_own_frames()
{
    let program = program();
    let (_, mem) = FakeMemory::new()
        .with_words(STACK, &[0, 0x1250, 0, 0x1310, 0, 0])
        .shared();
    let regs = DwarfRegisters::with_frame(ARCH, 0x1010, STACK, 0);

    let frames = StackIterator::new(Arc::clone(&program.bi), mem, regs, None)
        .stacktrace(10)
        .unwrap();
    assert_eq!(frames.len(), 4);

    let (inlined, physical) = (&frames[1], &frames[2]);
    assert!(inlined.inlined);
    assert_eq!(inlined.call.function_name(), Some("main.inl"));
    assert_eq!(inlined.current.function_name(), Some("main.main"));
    assert_eq!(inlined.regs.cfa, physical.regs.cfa);

    assert!(!physical.inlined);
    assert_eq!(physical.call.function_name(), Some("main.main"));
    assert_eq!(physical.call.file, "main.go");
    assert_eq!(physical.call.line, Some(12));
    assert_eq!(frames[3].current.function_name(), Some("runtime.goexit"));
}

#[test]
fn test_parse_parked_goroutine()
{
    let program = program();
    let (_, mem) = with_goroutine(FakeMemory::new())
        .with_words(G_SP, &[0, 0x1280, 0, 0x1310, 0, 0])
        .shared();

    let task = parse_task(&program, &mem);
    assert_eq!(task.id, 7);
    assert_eq!(task.status, 4);
    assert_eq!(task.wait_reason, "sleep");
    assert_eq!((task.pc, task.sp), (0x1410, G_SP));
    assert_eq!((task.stack_lo, task.stack_hi), (STACK_LO, STACK_HI));
    assert!(!task.system_stack);
    assert_eq!(task.current_loc.function_name(), Some("runtime.gopark"));

    let frames = task.stacktrace(10).unwrap();
    assert_eq!(names(&frames), ["runtime.gopark", "main.main", "runtime.goexit"]);
    // Goroutine frames are addressed from the top of their stack
    assert_eq!(frames[1].frame_offset(), (G_SP + 32) as i64 - STACK_HI as i64);

    let user = task.user_current();
    assert_eq!(user.function_name(), Some("main.main"));
    assert_eq!(user.pc, Address::new(0x1280));

    let go = task.go_location();
    assert_eq!(go.pc, Address::new(0x1020));
    assert_eq!(go.function_name(), Some("main.c"));

    let scope = EvalScope::from_task(&task).unwrap();
    assert_eq!(scope.location.function_name(), Some("runtime.gopark"));
    assert!(scope.task().is_some());
}

#[test]
fn test_nil_goroutine_pointer()
{
    let program = program();
    let (_, mem) = FakeMemory::new().with_words(0x5000, &[0]).shared();
    let pointer = program.bi.types().pointer_to(program.g);
    let g = Variable::new("gp", Address::new(0x5000), pointer, mem, Arc::clone(&program.bi));
    assert!(matches!(TaskContext::parse(&g), Err(QuarryError::Nil(_))));
}

#[test]
fn test_asmcgocall_returns_to_goroutine_stack()
{
    let program = program();
    // asmcgocall saved the goroutine stack pointer as a distance from the
    // top of the goroutine stack
    let (_, mem) = with_goroutine(FakeMemory::new())
        .with_words(SYS_SP, &[0, 0x1510, 0, 0xdead, 0, 0, 0, STACK_HI - G_SP])
        .with_words(G_SP, &[0, 0x1610, 0, 0x1280, 0, 0x1310, 0, 0])
        .shared();

    let task = parse_task(&program, &mem);
    let regs = DwarfRegisters::with_frame(ARCH, 0x3010, SYS_SP, 0);
    let frames = thread_stacktrace(Arc::clone(&program.bi), mem, regs, Some(&task), 10).unwrap();

    assert_eq!(
        names(&frames),
        [
            "_cgo_work",
            "runtime.asmcgocall",
            "runtime.cgocall",
            "main.main",
            "runtime.goexit"
        ]
    );
    let system: Vec<bool> = frames.iter().map(|frame| frame.system_stack).collect();
    assert_eq!(system, [true, true, false, false, false]);
    assert_eq!(frames[1].ret, 0x1610);
    assert_eq!(frames[1].return_address_slot(), G_SP + 8);
}

#[test]
fn test_cgocallback_returns_to_system_stack()
{
    let program = program();
    let (_, mem) = with_goroutine(FakeMemory::new())
        .with_words(G_SP, &[0, 0x1810, 0, 0xdead])
        .with_words(SYS_SP, &[0, 0x3110, 0, 0])
        .shared();

    let task = parse_task(&program, &mem);
    let regs = DwarfRegisters::with_frame(ARCH, 0x1710, G_SP, 0);
    let frames = thread_stacktrace(Arc::clone(&program.bi), mem, regs, Some(&task), 10).unwrap();

    assert_eq!(
        names(&frames),
        ["main.callback", "runtime.cgocallback_gofunc", "_cgo_callback"]
    );
    let system: Vec<bool> = frames.iter().map(|frame| frame.system_stack).collect();
    assert_eq!(system, [false, false, true]);
    assert!(frames.iter().all(|frame| frame.err.is_none()));
}

#[test]
fn test_cgo_round_trip_restores_stack_kind()
{
    let program = program();
    // Go called C through asmcgocall from a frame at G_CALL_SP, and C called
    // back into Go through cgocallback_gofunc
    const G_CALL_SP: u64 = G_SP + 0x100;
    let (_, mem) = with_goroutine(FakeMemory::new())
        .with_words(G_SP, &[0, 0x1810, 0, 0xdead])
        .with_words(
            SYS_SP,
            &[0, 0x3110, 0, 0x1510, 0, 0, 0, 0, 0, STACK_HI - G_CALL_SP],
        )
        .with_words(G_CALL_SP, &[0, 0x1610, 0, 0x1280, 0, 0x1310, 0, 0])
        .shared();

    let task = parse_task(&program, &mem);
    let regs = DwarfRegisters::with_frame(ARCH, 0x1710, G_SP, 0);
    let frames = thread_stacktrace(Arc::clone(&program.bi), mem, regs, Some(&task), 10).unwrap();

    assert_eq!(
        names(&frames),
        [
            "main.callback",
            "runtime.cgocallback_gofunc",
            "_cgo_callback",
            "runtime.asmcgocall",
            "runtime.cgocall",
            "main.main",
            "runtime.goexit"
        ]
    );
    let system: Vec<bool> = frames.iter().map(|frame| frame.system_stack).collect();
    assert_eq!(system, [false, false, true, true, false, false, false]);
    assert_eq!(frames.first().map(|f| f.system_stack), frames.last().map(|f| f.system_stack));
    assert_eq!(frames[3].return_address_slot(), G_CALL_SP + 8);
    assert!(frames.iter().all(|frame| frame.err.is_none()));
}

#[test]
fn test_negative_depth()
{
    let program = program();
    let (_, mem) = FakeMemory::new().shared();
    let regs = DwarfRegisters::with_frame(ARCH, 0x1010, STACK, 0);
    assert!(matches!(
        thread_stacktrace(program.bi, mem, regs, None, -1),
        Err(QuarryError::NegativeDepth)
    ));
}
