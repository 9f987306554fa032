//! Non-owning views into bridge blocks and their wire encoding.
//!
//! A slice array crosses the boundary as a host block holding consecutive
//! descriptors of three native-endian `i64` words: `[handle, offset, len]`.
use bytemuck::{Pod, Zeroable};

use super::{BlockArena, Handle};
use crate::error::BridgeError;

/// One slice as laid out in a descriptor block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SliceDescriptor {
    pub handle: i64,
    pub offset: i64,
    pub len: i64,
}

pub const DESCRIPTOR_SIZE: usize = size_of::<SliceDescriptor>();

/// A `(block, offset, len)` view. Never owns the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRef {
    pub handle: Handle,
    pub offset: usize,
    pub len: usize,
}

impl SliceRef {
    #[must_use]
    pub fn new(handle: Handle, offset: usize, len: usize) -> Self {
        Self {
            handle,
            offset,
            len,
        }
    }

    /// A view of the first `len` bytes of `handle`.
    #[must_use]
    pub fn prefix(handle: Handle, len: usize) -> Self {
        Self::new(handle, 0, len)
    }

    #[must_use]
    pub fn descriptor(&self) -> SliceDescriptor {
        SliceDescriptor {
            handle: self.handle.as_raw() as i64,
            offset: self.offset as i64,
            len: self.len as i64,
        }
    }
}

impl TryFrom<SliceDescriptor> for SliceRef {
    type Error = BridgeError;

    fn try_from(d: SliceDescriptor) -> Result<Self, Self::Error> {
        let offset = usize::try_from(d.offset).map_err(|_| BridgeError::InvalidSize(d.offset))?;
        let len = usize::try_from(d.len).map_err(|_| BridgeError::InvalidSize(d.len))?;
        Ok(Self::new(Handle::from_raw(d.handle as u64), offset, len))
    }
}

impl BlockArena {
    /// Encode `slices` into a newly allocated descriptor block.
    ///
    /// Returns the null handle for an empty list. The caller owns the block.
    pub fn write_descriptors(&self, slices: &[SliceRef]) -> Result<Handle, BridgeError> {
        if slices.is_empty() {
            return Ok(Handle::NULL);
        }
        let descriptors: Vec<SliceDescriptor> = slices.iter().map(SliceRef::descriptor).collect();
        let handle = self.allocate(descriptors.len() * DESCRIPTOR_SIZE)?;
        if let Err(e) = self.copy_in(handle, bytemuck::cast_slice(&descriptors)) {
            let _ = self.free(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Decode `n` descriptors from the start of `handle`.
    pub fn read_descriptors(&self, handle: Handle, n: usize) -> Result<Vec<SliceRef>, BridgeError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if handle.is_null() {
            return Err(BridgeError::UnknownHandle(0));
        }
        let byte_len = n
            .checked_mul(DESCRIPTOR_SIZE)
            .ok_or(BridgeError::InvalidSize(i64::MAX))?;
        let bytes = self.read_bytes(handle, 0, byte_len)?;
        bytes
            .chunks_exact(DESCRIPTOR_SIZE)
            .map(bytemuck::pod_read_unaligned::<SliceDescriptor>)
            .map(SliceRef::try_from)
            .collect()
    }
}
