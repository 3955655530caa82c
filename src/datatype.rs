//! Element types and the minimal derived layout used by RMA operations.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RmaError};

/// Predefined element types.
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
)]
pub enum BasicType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
}

impl BasicType {
    /// Size (and extent) of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            BasicType::Int8 | BasicType::Uint8 => 1,
            BasicType::Int16 | BasicType::Uint16 => 2,
            BasicType::Int32 | BasicType::Uint32 | BasicType::Float32 => 4,
            BasicType::Int64 | BasicType::Uint64 | BasicType::Float64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, BasicType::Float32 | BasicType::Float64)
    }
}

/// A Rust scalar that maps onto a [`BasicType`].
pub trait Element: Copy + PartialEq + std::fmt::Debug + 'static {
    const BASIC: BasicType;

    /// Read from exactly `BASIC.size()` native-endian bytes.
    fn read(bytes: &[u8]) -> Self;

    /// Write into exactly `BASIC.size()` native-endian bytes.
    fn write(self, bytes: &mut [u8]);
}

macro_rules! impl_element {
    ($($T:ty => $basic:ident),* $(,)*) => {
        $(
            impl Element for $T {
                const BASIC: BasicType = BasicType::$basic;

                fn read(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$T>()];
                    raw.copy_from_slice(bytes);
                    <$T>::from_ne_bytes(raw)
                }

                fn write(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_ne_bytes());
                }
            }
        )*
    };
}

impl_element! {
    i8 => Int8,
    u8 => Uint8,
    i16 => Int16,
    u16 => Uint16,
    i32 => Int32,
    u32 => Uint32,
    i64 => Int64,
    u64 => Uint64,
    f32 => Float32,
    f64 => Float64,
}

/// Encode typed values into a native-endian byte buffer.
pub fn encode<T: Element>(values: &[T]) -> Vec<u8> {
    let size = T::BASIC.size();
    let mut bytes = vec![0u8; values.len() * size];
    for (v, chunk) in values.iter().zip(bytes.chunks_exact_mut(size)) {
        v.write(chunk);
    }
    bytes
}

/// Decode a native-endian byte buffer into typed values. Trailing partial elements are ignored.
pub fn decode<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::BASIC.size()).map(T::read).collect()
}

/// A contiguous byte run, relative to the start of a typed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoVec {
    pub offset: usize,
    pub len: usize,
}

impl IoVec {
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    pub const fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// A non-contiguous layout of one basic type.
///
/// One instance is a list of byte blocks inside `extent` bytes; consecutive instances are
/// laid out `extent` bytes apart. A block may end in the middle of an element only if the
/// next block continues it contiguously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedType {
    basic: BasicType,
    blocks: Vec<IoVec>,
    size: usize,
    extent: usize,
}

impl DerivedType {
    /// Build a layout from explicit byte blocks.
    pub fn from_blocks(basic: BasicType, blocks: Vec<IoVec>, extent: usize) -> Result<Self> {
        if blocks.is_empty() {
            return Err(RmaError::InvalidDatatype("layout has no blocks"));
        }
        let esize = basic.size();
        let mut prev_end = 0;
        let mut carry = 0;
        for (i, b) in blocks.iter().enumerate() {
            if b.len == 0 {
                return Err(RmaError::InvalidDatatype("empty block"));
            }
            if i > 0 && b.offset < prev_end {
                return Err(RmaError::InvalidDatatype("blocks overlap or are unordered"));
            }
            if carry != 0 && b.offset != prev_end {
                return Err(RmaError::InvalidDatatype("element split across a gap"));
            }
            if b.end() > extent {
                return Err(RmaError::InvalidDatatype("block exceeds the extent"));
            }
            carry = (carry + b.len) % esize;
            prev_end = b.end();
        }
        if carry != 0 {
            return Err(RmaError::InvalidDatatype("size is not a whole number of elements"));
        }

        let size = blocks.iter().map(|b| b.len).sum();
        Ok(Self {
            basic,
            blocks,
            size,
            extent,
        })
    }

    /// `count` blocks of `blocklen` elements, block starts `stride` elements apart.
    pub fn vector(count: usize, blocklen: usize, stride: usize, basic: BasicType) -> Result<Self> {
        if count == 0 || blocklen == 0 {
            return Err(RmaError::InvalidDatatype("empty vector"));
        }
        if blocklen > stride && count > 1 {
            return Err(RmaError::InvalidDatatype("vector blocks overlap"));
        }
        let esize = basic.size();
        let blocks = (0..count)
            .map(|i| IoVec::new(i * stride * esize, blocklen * esize))
            .collect();
        let extent = ((count - 1) * stride + blocklen) * esize;
        Self::from_blocks(basic, blocks, extent)
    }

    /// Blocks of `blocklens[i]` elements at element displacement `displs[i]`.
    pub fn indexed(blocklens: &[usize], displs: &[usize], basic: BasicType) -> Result<Self> {
        if blocklens.len() != displs.len() {
            return Err(RmaError::InvalidDatatype("block lengths and displacements differ"));
        }
        let esize = basic.size();
        let blocks: Vec<_> = blocklens
            .iter()
            .zip(displs)
            .map(|(&len, &disp)| IoVec::new(disp * esize, len * esize))
            .collect();
        let extent = blocks.iter().map(IoVec::end).max().unwrap_or(0);
        Self::from_blocks(basic, blocks, extent)
    }

    pub fn basic_type(&self) -> BasicType {
        self.basic
    }

    /// Bytes of data in one instance.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Span of one instance.
    pub fn extent(&self) -> usize {
        self.extent
    }

    pub fn blocks(&self) -> &[IoVec] {
        &self.blocks
    }

    /// Contiguous runs of `count` instances that hold the packed-stream bytes `[first, last)`.
    ///
    /// Runs follow block boundaries of the layout; they are not merged.
    pub fn pack_vector(&self, count: usize, first: usize, last: usize) -> Vec<IoVec> {
        let last = last.min(self.size * count);
        let mut runs = Vec::new();
        if first >= last {
            return runs;
        }

        let mut inst = first / self.size;
        let mut pos = inst * self.size;
        'outer: while inst < count {
            let base = inst * self.extent;
            for b in &self.blocks {
                let (start, end) = (pos, pos + b.len);
                pos = end;
                if end <= first {
                    continue;
                }
                if start >= last {
                    break 'outer;
                }
                let lo = start.max(first);
                let hi = end.min(last);
                runs.push(IoVec::new(base + b.offset + (lo - start), hi - lo));
            }
            inst += 1;
        }
        runs
    }
}

/// Layout of a typed buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datatype {
    Predefined(BasicType),
    Derived(DerivedType),
}

impl From<BasicType> for Datatype {
    fn from(basic: BasicType) -> Self {
        Datatype::Predefined(basic)
    }
}

impl From<DerivedType> for Datatype {
    fn from(derived: DerivedType) -> Self {
        Datatype::Derived(derived)
    }
}

impl Datatype {
    pub fn is_predefined(&self) -> bool {
        matches!(self, Datatype::Predefined(_))
    }

    pub fn basic_type(&self) -> BasicType {
        match self {
            Datatype::Predefined(b) => *b,
            Datatype::Derived(d) => d.basic_type(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Datatype::Predefined(b) => b.size(),
            Datatype::Derived(d) => d.size(),
        }
    }

    pub fn extent(&self) -> usize {
        match self {
            Datatype::Predefined(b) => b.size(),
            Datatype::Derived(d) => d.extent(),
        }
    }

    /// Contiguous runs of `count` instances that hold the packed-stream bytes `[first, last)`.
    pub fn pack_vector(&self, count: usize, first: usize, last: usize) -> Vec<IoVec> {
        match self {
            Datatype::Predefined(b) => {
                let last = last.min(b.size() * count);
                if first >= last {
                    Vec::new()
                } else {
                    vec![IoVec::new(first, last - first)]
                }
            }
            Datatype::Derived(d) => d.pack_vector(count, first, last),
        }
    }

    /// Gather the packed bytes `[first, last)` of `count` instances laid out in `buf`.
    pub fn pack_range(&self, buf: &[u8], count: usize, first: usize, last: usize) -> Result<Vec<u8>> {
        let runs = self.pack_vector(count, first, last);
        let mut packed = Vec::with_capacity(last.saturating_sub(first));
        for run in runs {
            packed.extend_from_slice(checked(buf, run)?);
        }
        Ok(packed)
    }

    /// Gather all `count` instances laid out in `buf`.
    pub fn pack(&self, buf: &[u8], count: usize) -> Result<Vec<u8>> {
        self.pack_range(buf, count, 0, self.size() * count)
    }

    /// Scatter packed bytes, which start at packed-stream offset `first`, into `buf`.
    pub fn unpack_range(&self, data: &[u8], count: usize, first: usize, buf: &mut [u8]) -> Result<()> {
        if first + data.len() > self.size() * count {
            return Err(RmaError::OutOfBounds {
                offset: first,
                len: data.len(),
                size: self.size() * count,
            });
        }
        let mut done = 0;
        for run in self.pack_vector(count, first, first + data.len()) {
            checked_mut(buf, run)?.copy_from_slice(&data[done..done + run.len]);
            done += run.len;
        }
        Ok(())
    }
}

pub(crate) fn checked(buf: &[u8], run: IoVec) -> Result<&[u8]> {
    buf.get(run.offset..run.end()).ok_or(RmaError::OutOfBounds {
        offset: run.offset,
        len: run.len,
        size: buf.len(),
    })
}

pub(crate) fn checked_mut(buf: &mut [u8], run: IoVec) -> Result<&mut [u8]> {
    let size = buf.len();
    buf.get_mut(run.offset..run.end()).ok_or(RmaError::OutOfBounds {
        offset: run.offset,
        len: run.len,
        size,
    })
}
