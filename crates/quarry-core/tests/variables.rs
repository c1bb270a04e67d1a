//! Maps, assignment and expressions against package variables

mod common;

use std::sync::Arc;

use common::FakeMemory;
use gimli::constants;
use quarry_core::binary::{BinaryInfo, BinaryInfoBuilder, LocationDescription, TypeId, TypeKind, VariableEntry};
use quarry_core::error::QuarryError;
use quarry_core::eval::{EvalScope, LoadConfig, Value, Variable};
use quarry_core::memory::Memory;
use quarry_core::types::{Address, Architecture};

const GLOBALS: u64 = 0x50_0000;
const HMAP: u64 = 0x2000;
const BUCKETS: u64 = 0x3000;
const OLD_BUCKETS: u64 = 0x4000;

/// Slot tag of an occupied entry
const TOPHASH_FULL: u8 = 0x80;
/// Slot tag of an entry moved to the first half of the grown table
const EVACUATED_X: u8 = 2;

fn addr(address: u64) -> LocationDescription
{
    let mut expression = vec![constants::DW_OP_addr.0];
    expression.extend_from_slice(&address.to_le_bytes());
    LocationDescription::Expression(expression)
}

/// A `map[int]int` bucket holding `entries`, each slot tagged `tag`.
fn bucket(entries: &[(u64, u64)], tag: u8) -> Vec<u8>
{
    let mut tophash = [0u8; 8];
    let mut keys = [0u64; 8];
    let mut values = [0u64; 8];
    for (slot, (key, value)) in entries.iter().enumerate() {
        tophash[slot] = tag;
        keys[slot] = *key;
        values[slot] = *value;
    }
    let mut bytes = tophash.to_vec();
    bytes.extend(common::words(&keys));
    bytes.extend(common::words(&values));
    bytes.extend(common::words(&[0]));
    bytes
}

/// A two-bucket map grown from a one-bucket table, with `old` as the
/// single old bucket.
fn growing_map(count: u64, old: Vec<u8>) -> FakeMemory
{
    let mut new = bucket(&[(1, 10), (3, 30)], TOPHASH_FULL);
    new.extend(bucket(&[], 0));
    FakeMemory::new()
        // count, then flags and B = 1 packed into one word
        .with_words(HMAP, &[count, 1 << 8, BUCKETS, OLD_BUCKETS, 0, 0])
        .with(BUCKETS, new)
        .with(OLD_BUCKETS, old)
}

struct Program
{
    bi: Arc<BinaryInfo>,
    map: TypeId,
}

fn program() -> Program
{
    common::init_tracing();
    let builder = BinaryInfoBuilder::new(Architecture::X86_64);
    let types = builder.types();
    let int = types.basic("int", 8, TypeKind::Int);
    let float = types.basic("float64", 8, TypeKind::Float);
    let boolean = types.basic("bool", 1, TypeKind::Bool);
    let string = types.string_type();
    let map = types.map_of(int, int);

    let bi = builder
        .package_variable(VariableEntry::new("main.counter", int, addr(GLOBALS)))
        .package_variable(VariableEntry::new("main.ratio", float, addr(GLOBALS + 8)))
        .package_variable(VariableEntry::new("main.ready", boolean, addr(GLOBALS + 16)))
        .package_variable(VariableEntry::new("main.m", map, addr(GLOBALS + 24)))
        .package_variable(VariableEntry::new("main.name", string, addr(0x60_0000)))
        .build();
    Program { bi: Arc::new(bi), map }
}

fn entries(map: &Variable) -> Vec<(i64, i64)>
{
    let int = |v: &Variable| v.value.as_ref().and_then(Value::as_i64).unwrap();
    let mut entries: Vec<_> = map
        .children
        .chunks(2)
        .map(|pair| (int(&pair[0]), int(&pair[1])))
        .collect();
    entries.sort_unstable();
    entries
}

#[test]
fn test_map_growth_reads_unevacuated_bucket_once()
{
    let program = program();
    let old = bucket(&[(1, 10), (2, 20), (3, 30)], TOPHASH_FULL);
    let (_, mem) = growing_map(3, old).with_words(0x1000, &[HMAP]).shared();

    let mut map = Variable::new("m", Address::new(0x1000), program.map, Arc::clone(&mem), Arc::clone(&program.bi));
    map.load_value(&LoadConfig::full_value());
    assert!(map.unreadable.is_none());
    assert_eq!(map.len, 3);
    assert_eq!(map.base, Address::new(HMAP));
    assert_eq!(entries(&map), [(1, 10), (2, 20), (3, 30)]);

    let key = Variable::constant(Value::Int(2), Arc::clone(&mem), Arc::clone(&program.bi));
    let mut value = map.map_access(&key).unwrap();
    value.load_value(&LoadConfig::single_value());
    assert_eq!(value.value, Some(Value::Int(20)));

    let missing = Variable::constant(Value::Int(9), mem, Arc::clone(&program.bi));
    assert!(matches!(map.map_access(&missing), Err(QuarryError::InvalidAccess(_))));
}

#[test]
fn test_map_growth_skips_evacuated_bucket()
{
    let program = program();
    // Same keys, but already moved to the new table
    let old = bucket(&[(1, 10), (2, 20), (3, 30)], EVACUATED_X);
    let (_, mem) = growing_map(2, old).with_words(0x1000, &[HMAP]).shared();

    let mut map = Variable::new("m", Address::new(0x1000), program.map, mem, Arc::clone(&program.bi));
    map.load_value(&LoadConfig::full_value());
    assert_eq!(entries(&map), [(1, 10), (3, 30)]);
}

#[test]
fn test_nil_map_is_empty()
{
    let program = program();
    let (_, mem) = FakeMemory::new().with_words(0x1000, &[0]).shared();

    let mut map = Variable::new("m", Address::new(0x1000), program.map, mem, Arc::clone(&program.bi));
    map.load_value(&LoadConfig::full_value());
    assert!(map.unreadable.is_none());
    assert_eq!(map.len, 0);
    assert!(map.children.is_empty());
}

fn global_scope(program: &Program) -> (Arc<FakeMemory>, EvalScope)
{
    let old = bucket(&[(1, 10), (2, 20), (3, 30)], TOPHASH_FULL);
    let (fake, mem): (Arc<FakeMemory>, Memory) = growing_map(3, old)
        .with_words(GLOBALS, &[11, 0, 0, HMAP])
        .shared();
    (fake, EvalScope::global(Arc::clone(&program.bi), mem))
}

#[test]
fn test_set_variable_writes_converted_values()
{
    let program = program();
    let (fake, scope) = global_scope(&program);

    scope.set_variable("main.counter", "-5").unwrap();
    scope.set_variable("main.ratio", "2").unwrap();
    scope.set_variable("main.ready", "true").unwrap();
    assert_eq!(
        fake.writes(),
        [
            (GLOBALS, (-5i64).to_le_bytes().to_vec()),
            (GLOBALS + 8, 2.0f64.to_le_bytes().to_vec()),
            (GLOBALS + 16, vec![1]),
        ]
    );

    let counter = scope.eval_variable("main.counter", &LoadConfig::single_value()).unwrap();
    assert_eq!(counter.value, Some(Value::Int(-5)));
}

#[test]
fn test_set_variable_rejects_bad_assignments()
{
    let program = program();
    let (fake, scope) = global_scope(&program);

    assert!(matches!(
        scope.set_variable("main.counter", "true"),
        Err(QuarryError::TypeMismatch(_))
    ));
    // The string header itself cannot be read
    assert!(matches!(
        scope.set_variable("main.name", "nil"),
        Err(QuarryError::Unreadable { .. })
    ));
    assert!(fake.writes().is_empty());
}

#[test]
fn test_expressions_over_package_variables()
{
    let program = program();
    let (_, scope) = global_scope(&program);
    let cfg = LoadConfig::full_value();

    let value = scope.eval_expression("main.m[2]", &cfg).unwrap();
    assert_eq!(value.value, Some(Value::Int(20)));
    assert_eq!(value.name, "main.m[2]");

    let negated = scope.eval_expression("-main.counter", &cfg).unwrap();
    assert_eq!(negated.value, Some(Value::Int(-11)));

    let map = scope.eval_variable("main.m", &cfg).unwrap();
    assert_eq!(map.len, 3);
    assert_eq!(map.children.len(), 6);

    assert!(scope.eval_expression("main.m[9]", &cfg).is_err());
    assert!(matches!(scope.find_global("main.nothing"), Err(QuarryError::SymbolNotFound(_))));
}
