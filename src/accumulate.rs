//! Accumulate engine: apply a predefined reduction from a packed source into a typed target.

use serde::{Deserialize, Serialize};

use crate::datatype::{checked, checked_mut, BasicType, Datatype, Element};
use crate::error::{Result, RmaError};

/// Predefined reductions.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::FromRepr,
)]
#[repr(u8)]
pub enum ReduceOp {
    Max = 1,
    Min,
    Sum,
    Prod,
    Land,
    Band,
    Lor,
    Bor,
    Lxor,
    Bxor,
    /// Overwrite the target with the source.
    Replace,
    /// Leave the target untouched; used by fetch-only accesses.
    NoOp,
}

/// Operator handle as carried in packets.
///
/// | Bits  | Meaning                         |
/// | ----- | ------------------------------- |
/// | 31-26 | `0b010110` for predefined ops   |
/// | 25-8  | zero                            |
/// | 7-0   | [`ReduceOp`] discriminant       |
///
/// Any other handle names a user-defined operator, which passive-target accumulate rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpHandle(pub u32);

const BUILTIN_OP_BASE: u32 = 0x5800_0000;
const BUILTIN_OP_MASK: u32 = 0xffff_ff00;

impl OpHandle {
    pub const fn builtin(op: ReduceOp) -> Self {
        OpHandle(BUILTIN_OP_BASE | op as u32)
    }

    pub const fn is_builtin(self) -> bool {
        self.0 & BUILTIN_OP_MASK == BUILTIN_OP_BASE
    }
}

impl From<ReduceOp> for OpHandle {
    fn from(op: ReduceOp) -> Self {
        OpHandle::builtin(op)
    }
}

impl TryFrom<OpHandle> for ReduceOp {
    type Error = RmaError;

    fn try_from(handle: OpHandle) -> Result<Self> {
        if !handle.is_builtin() {
            return Err(RmaError::OpNotPredefined(handle.0));
        }
        ReduceOp::from_repr(handle.0 as u8).ok_or(RmaError::OpNotPredefined(handle.0))
    }
}

/// Element-wise reduction `dst = op(src, dst)`.
trait Reduce: Element {
    fn supports(op: ReduceOp) -> bool;
    fn reduce(op: ReduceOp, src: Self, dst: Self) -> Self;
}

macro_rules! impl_int_reduce {
    ($($T:ty),*) => {
        $(
            impl Reduce for $T {
                fn supports(_: ReduceOp) -> bool {
                    true
                }

                fn reduce(op: ReduceOp, s: Self, t: Self) -> Self {
                    match op {
                        ReduceOp::Max => s.max(t),
                        ReduceOp::Min => s.min(t),
                        ReduceOp::Sum => s.wrapping_add(t),
                        ReduceOp::Prod => s.wrapping_mul(t),
                        ReduceOp::Land => (s != 0 && t != 0) as $T,
                        ReduceOp::Band => s & t,
                        ReduceOp::Lor => (s != 0 || t != 0) as $T,
                        ReduceOp::Bor => s | t,
                        ReduceOp::Lxor => ((s != 0) ^ (t != 0)) as $T,
                        ReduceOp::Bxor => s ^ t,
                        ReduceOp::Replace => s,
                        ReduceOp::NoOp => t,
                    }
                }
            }
        )*
    };
}

macro_rules! impl_float_reduce {
    ($($T:ty),*) => {
        $(
            impl Reduce for $T {
                fn supports(op: ReduceOp) -> bool {
                    matches!(
                        op,
                        ReduceOp::Max
                            | ReduceOp::Min
                            | ReduceOp::Sum
                            | ReduceOp::Prod
                            | ReduceOp::Replace
                            | ReduceOp::NoOp
                    )
                }

                fn reduce(op: ReduceOp, s: Self, t: Self) -> Self {
                    match op {
                        ReduceOp::Max => s.max(t),
                        ReduceOp::Min => s.min(t),
                        ReduceOp::Sum => s + t,
                        ReduceOp::Prod => s * t,
                        ReduceOp::Replace => s,
                        _ => t,
                    }
                }
            }
        )*
    };
}

impl_int_reduce!(i8, u8, i16, u16, i32, u32, i64, u64);
impl_float_reduce!(f32, f64);

fn reduce_run<T: Reduce>(op: ReduceOp, src: &[u8], dst: &mut [u8]) {
    let size = T::BASIC.size();
    for (s, t) in src.chunks_exact(size).zip(dst.chunks_exact_mut(size)) {
        T::reduce(op, T::read(s), T::read(t)).write(t);
    }
}

fn supports(op: ReduceOp, ty: BasicType) -> bool {
    match ty {
        BasicType::Int8 => i8::supports(op),
        BasicType::Uint8 => u8::supports(op),
        BasicType::Int16 => i16::supports(op),
        BasicType::Uint16 => u16::supports(op),
        BasicType::Int32 => i32::supports(op),
        BasicType::Uint32 => u32::supports(op),
        BasicType::Int64 => i64::supports(op),
        BasicType::Uint64 => u64::supports(op),
        BasicType::Float32 => f32::supports(op),
        BasicType::Float64 => f64::supports(op),
    }
}

/// Apply `op` over equally sized runs of `ty` elements.
fn apply_run(op: ReduceOp, ty: BasicType, src: &[u8], dst: &mut [u8]) {
    debug_assert_eq!(src.len(), dst.len());
    if op == ReduceOp::Replace {
        dst.copy_from_slice(src);
        return;
    }
    match ty {
        BasicType::Int8 => reduce_run::<i8>(op, src, dst),
        BasicType::Uint8 => reduce_run::<u8>(op, src, dst),
        BasicType::Int16 => reduce_run::<i16>(op, src, dst),
        BasicType::Uint16 => reduce_run::<u16>(op, src, dst),
        BasicType::Int32 => reduce_run::<i32>(op, src, dst),
        BasicType::Uint32 => reduce_run::<u32>(op, src, dst),
        BasicType::Int64 => reduce_run::<i64>(op, src, dst),
        BasicType::Uint64 => reduce_run::<u64>(op, src, dst),
        BasicType::Float32 => reduce_run::<f32>(op, src, dst),
        BasicType::Float64 => reduce_run::<f64>(op, src, dst),
    }
}

/// Reduce `source_count` packed `source_type` elements into `target`.
///
/// `target` starts at the target region; it holds `target_count` instances of `target_type`.
/// `stream_offset` is the packed-stream byte offset of `source[0]` within the whole transfer.
pub fn do_accumulate_op(
    source: &[u8],
    source_count: usize,
    source_type: BasicType,
    target: &mut [u8],
    target_count: usize,
    target_type: &Datatype,
    stream_offset: usize,
    op: OpHandle,
) -> Result<()> {
    let op = ReduceOp::try_from(op)?;
    if op == ReduceOp::NoOp {
        return Ok(());
    }
    if target_type.basic_type() != source_type {
        return Err(RmaError::InvalidDatatype(
            "source and target element types differ",
        ));
    }
    if !supports(op, source_type) {
        return Err(RmaError::OpTypeMismatch {
            op,
            ty: source_type,
        });
    }

    if source_count == 0 {
        return Ok(());
    }

    let size = source_type.size();
    let source = checked(
        source,
        crate::datatype::IoVec::new(0, source_count * size),
    )?;

    match target_type {
        Datatype::Predefined(_) => {
            let real_stream_offset = (stream_offset / size) * target_type.extent();
            let run = crate::datatype::IoVec::new(real_stream_offset, source.len());
            apply_run(op, source_type, source, checked_mut(target, run)?);
            Ok(())
        }
        Datatype::Derived(_) => {
            let first = stream_offset;
            let last = first + source.len();
            let runs = target_type.pack_vector(target_count, first, last);
            if runs.is_empty() {
                return Err(RmaError::OutOfBounds {
                    offset: first,
                    len: source.len(),
                    size: target_type.size() * target_count,
                });
            }

            let mut i = 0;
            let mut loc = runs[0].offset;
            let mut len = runs[0].len;
            let mut done = 0;
            while i < runs.len() {
                if len < size {
                    // A partial element continues in the next run.
                    i += 1;
                    match runs.get(i) {
                        Some(next) if next.offset == loc + len => len += next.len,
                        _ => return Err(RmaError::InvalidDatatype("element split across a gap")),
                    }
                    continue;
                }

                let count = len / size;
                let span = count * size;
                let run = crate::datatype::IoVec::new(loc, span);
                apply_run(
                    op,
                    source_type,
                    &source[done * size..done * size + span],
                    checked_mut(target, run)?,
                );
                done += count;

                if len % size == 0 {
                    i += 1;
                    if let Some(next) = runs.get(i) {
                        loc = next.offset;
                        len = next.len;
                    }
                } else {
                    loc += span;
                    len -= span;
                }
            }

            if done != source_count {
                return Err(RmaError::OutOfBounds {
                    offset: first,
                    len: source.len(),
                    size: target_type.size() * target_count,
                });
            }
            Ok(())
        }
    }
}
