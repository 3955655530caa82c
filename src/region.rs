//! Memory region descriptors.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::datatype::{decode, BasicType, Datatype, Element};
use crate::error::{Result, RmaError};

/// A typed view of a buffer: `count` instances of `datatype` starting `offset` bytes in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRegion {
    pub offset: usize,
    pub count: usize,
    pub datatype: Datatype,
}

impl MemRegion {
    pub fn new(offset: usize, count: usize, datatype: impl Into<Datatype>) -> Self {
        Self {
            offset,
            count,
            datatype: datatype.into(),
        }
    }

    /// `count` elements of `basic` laid out back to back.
    pub fn contiguous(offset: usize, count: usize, basic: BasicType) -> Self {
        Self::new(offset, count, basic)
    }

    /// Bytes of data described.
    pub fn data_size(&self) -> usize {
        self.datatype.size() * self.count
    }

    /// Bytes spanned in the underlying buffer.
    pub fn span(&self) -> usize {
        self.datatype.extent() * self.count
    }

    pub fn basic_type(&self) -> BasicType {
        self.datatype.basic_type()
    }

    /// Fail unless the region lies inside a buffer of `len` bytes.
    pub fn check_within(&self, len: usize) -> Result<()> {
        match self.offset.checked_add(self.span()) {
            Some(end) if end <= len => Ok(()),
            _ => Err(RmaError::OutOfBounds {
                offset: self.offset,
                len: self.span(),
                size: len,
            }),
        }
    }

    /// Slice of `buf` starting at the region.
    pub fn slice_of<'a>(&self, buf: &'a [u8]) -> Result<&'a [u8]> {
        self.check_within(buf.len())?;
        Ok(&buf[self.offset..])
    }

    pub fn slice_of_mut<'a>(&self, buf: &'a mut [u8]) -> Result<&'a mut [u8]> {
        self.check_within(buf.len())?;
        Ok(&mut buf[self.offset..])
    }
}

/// Origin-side buffer that receives fetched data.
///
/// Cloning shares the buffer, so the caller keeps a handle while the engine fills it.
#[derive(Debug, Clone, Default)]
pub struct ResultBuffer(Arc<Mutex<Vec<u8>>>);

impl ResultBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self::from_bytes(vec![0; len])
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(bytes)))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Decode the whole buffer as values of `T`.
    pub fn values<T: Element>(&self) -> Vec<T> {
        decode(&self.lock())
    }
}
