//! DWARF location expression evaluation.
//!
//! Expressions are run with gimli's evaluator; this module only answers its
//! requests for registers, memory, the frame base and the CFA, and converts
//! the final pieces into crate types.

use gimli::{EndianSlice, EvaluationResult, RunTimeEndian, Value};

use crate::error::{QuarryError, QuarryResult};
use crate::memory::{read_uint, MemoryReadWriter};
use crate::types::{Address, DwarfRegisters};

/// Where one piece of a value lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceLocation
{
    /// In a register, by DWARF number
    Register(u16),
    /// In target memory
    Address(u64),
    /// Computed by the expression (`DW_OP_stack_value`)
    Value(u64),
    /// Literal bytes from the debug information (`DW_OP_implicit_value`)
    Bytes(Vec<u8>),
    /// Optimized out
    Empty,
}

/// A fragment of a value; `size` is in bytes, zero when the piece is the
/// whole value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece
{
    pub size: usize,
    pub location: PieceLocation,
}

/// Run `expression` against `regs`.
///
/// Returns the address the expression computes when it describes a plain
/// memory location. Otherwise the address is zero and the value is described
/// by the returned pieces. Memory dereferences inside the expression need
/// `memory`; without it they fail.
pub fn execute_stack_program(
    regs: &DwarfRegisters,
    expression: &[u8],
    memory: Option<&dyn MemoryReadWriter>,
) -> QuarryResult<(i64, Vec<Piece>)>
{
    evaluate(regs, expression, memory, None)
}

/// Run a CFI register rule expression, which starts with the CFA pushed.
pub(crate) fn execute_frame_expression(
    regs: &DwarfRegisters,
    expression: &[u8],
    cfa: i64,
    memory: Option<&dyn MemoryReadWriter>,
) -> QuarryResult<i64>
{
    let (address, pieces) = evaluate(regs, expression, memory, Some(cfa as u64))?;
    match pieces.as_slice() {
        [] => Ok(address),
        [Piece {
            location: PieceLocation::Value(value),
            ..
        }] => Ok(*value as i64),
        _ => Err(QuarryError::Unsupported("composite location in a frame rule".into())),
    }
}

fn evaluate(
    regs: &DwarfRegisters,
    expression: &[u8],
    memory: Option<&dyn MemoryReadWriter>,
    initial: Option<u64>,
) -> QuarryResult<(i64, Vec<Piece>)>
{
    let encoding = gimli::Encoding {
        format: gimli::Format::Dwarf32,
        version: 4,
        address_size: regs.architecture().pointer_size(),
    };
    let reader = EndianSlice::new(expression, RunTimeEndian::Little);
    let mut evaluation = gimli::Expression(reader).evaluation(encoding);
    if let Some(initial) = initial {
        evaluation.set_initial_value(initial);
    }

    let mut result = evaluation.evaluate().map_err(eval_error)?;
    loop {
        result = match result {
            EvaluationResult::Complete => break,
            EvaluationResult::RequiresRegister { register, .. } => {
                let value = regs
                    .reg(register.0)
                    .ok_or(QuarryError::RegisterUnavailable(register.0))?;
                evaluation.resume_with_register(Value::Generic(value))
            }
            EvaluationResult::RequiresMemory { address, size, .. } => {
                let memory = memory.ok_or_else(|| QuarryError::Unsupported("memory access without a reader".into()))?;
                let raw = read_uint(memory, Address::new(address), usize::from(size))?;
                let value = match size {
                    1 => Value::U8(raw as u8),
                    2 => Value::U16(raw as u16),
                    4 => Value::U32(raw as u32),
                    _ => Value::Generic(raw),
                };
                evaluation.resume_with_memory(value)
            }
            EvaluationResult::RequiresFrameBase => evaluation.resume_with_frame_base(regs.frame_base as u64),
            EvaluationResult::RequiresCallFrameCfa => evaluation.resume_with_call_frame_cfa(regs.cfa as u64),
            EvaluationResult::RequiresRelocatedAddress(address) => evaluation.resume_with_relocated_address(address),
            other => return Err(QuarryError::Unsupported(format!("{other:?}"))),
        }
        .map_err(eval_error)?;
    }

    let raw_pieces = evaluation.result();
    if let [gimli::Piece {
        size_in_bits: None,
        location: gimli::Location::Address { address },
        ..
    }] = raw_pieces.as_slice()
    {
        return Ok((*address as i64, Vec::new()));
    }

    let pieces = raw_pieces
        .into_iter()
        .map(|piece| {
            let location = match piece.location {
                gimli::Location::Empty => PieceLocation::Empty,
                gimli::Location::Register { register } => PieceLocation::Register(register.0),
                gimli::Location::Address { address } => PieceLocation::Address(address),
                gimli::Location::Value { value } => {
                    PieceLocation::Value(value.to_u64(u64::MAX).map_err(eval_error)?)
                }
                gimli::Location::Bytes { value } => PieceLocation::Bytes(value.slice().to_vec()),
                _ => return Err(QuarryError::Unsupported("implicit pointer".into())),
            };
            let size = piece.size_in_bits.map_or(0, |bits| (bits / 8) as usize);
            Ok(Piece { size, location })
        })
        .collect::<QuarryResult<Vec<_>>>()?;
    Ok((0, pieces))
}

fn eval_error(err: gimli::Error) -> QuarryError
{
    QuarryError::dwarf("evaluating location expression", err)
}
