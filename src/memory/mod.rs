//! Native memory bridge.
//!
//! Blocks live in an arena and are addressed by opaque, never-reused
//! [`Handle`]s. The arena records each block's size, so every read and write
//! is bounds-checked, and a freed handle is reported instead of aliasing a
//! newer block. Handle `0` is the null handle: reads return zero/empty and
//! writes and frees are no-ops.
//!
//! Two kinds of block share the handle space: host blocks (zeroed byte
//! buffers) and engine batches registered by the adapter. Each kind can only
//! be released through its own path.
pub mod slice;

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::engine::abi::{EmbeddingBatch, FreeBatchFn};
use crate::error::BridgeError;

pub use slice::{DESCRIPTOR_SIZE, SliceDescriptor, SliceRef};

/// Size in bytes of the integers read and written by the bridge.
pub const INTEGER_SIZE: usize = size_of::<i64>();

const FLOAT_SIZE: usize = size_of::<f32>();

/// Opaque reference to a block in a [`BlockArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(u64);

impl Handle {
    pub const NULL: Handle = Handle(0);

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An engine-owned batch registered in the arena.
///
/// The engine's destructor runs exactly once, when the last reference to the
/// block is dropped.
pub struct EngineBatch {
    raw: EmbeddingBatch,
    release: FreeBatchFn,
}

// The batch is immutable once the engine returns it, and the engine's
// destructor is only invoked from `Drop`.
unsafe impl Send for EngineBatch {}
unsafe impl Sync for EngineBatch {}

impl EngineBatch {
    /// Take ownership of a batch populated by the engine.
    ///
    /// # Safety
    ///
    /// `raw` must have been populated by a successful engine `generate` call
    /// and `release` must be that engine's batch destructor.
    pub unsafe fn new(raw: EmbeddingBatch, release: FreeBatchFn) -> Self {
        Self { raw, release }
    }

    /// `(n_vectors, dim)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.raw.n_vectors, self.raw.dim)
    }

    #[must_use]
    pub fn floats(&self) -> &[f32] {
        match self.raw.len() {
            Some(len) if !self.raw.data.is_null() && len > 0 => unsafe {
                std::slice::from_raw_parts(self.raw.data, len)
            },
            _ => &[],
        }
    }
}

impl Drop for EngineBatch {
    fn drop(&mut self) {
        debug!(
            n_vectors = self.raw.n_vectors,
            dim = self.raw.dim,
            "Releasing engine batch"
        );
        unsafe { (self.release)(&mut self.raw) };
    }
}

pub(crate) enum Block {
    Host(RwLock<Box<[u8]>>),
    Batch(EngineBatch),
}

/// Process-wide table of live blocks.
pub struct BlockArena {
    blocks: Mutex<HashMap<u64, Arc<Block>>>,
    next_handle: AtomicU64,
    max_block_size: usize,
}

static BRIDGE: OnceLock<Arc<BlockArena>> = OnceLock::new();

/// The arena used by the C ABI, created on first use.
pub fn global() -> &'static Arc<BlockArena> {
    BRIDGE.get_or_init(|| Arc::new(BlockArena::default()))
}

/// Create the global arena with a specific block size limit.
///
/// Returns `false` if the global arena already exists.
pub fn configure(max_block_size: usize) -> bool {
    BRIDGE
        .set(Arc::new(BlockArena::new(max_block_size)))
        .is_ok()
}

impl Default for BlockArena {
    fn default() -> Self {
        Self::new(crate::config::Config::default().max_block_size)
    }
}

fn range(handle: Handle, offset: usize, len: usize, size: usize) -> Result<Range<usize>, BridgeError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(BridgeError::OutOfBounds {
            handle: handle.as_raw(),
            offset,
            len,
            size,
        }),
    }
}

impl BlockArena {
    #[must_use]
    pub fn new(max_block_size: usize) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            max_block_size,
        }
    }

    fn next_handle(&self) -> Handle {
        Handle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn block(&self, handle: Handle) -> Result<Arc<Block>, BridgeError> {
        self.blocks
            .lock()
            .get(&handle.as_raw())
            .cloned()
            .ok_or(BridgeError::UnknownHandle(handle.as_raw()))
    }

    fn with_host<R>(
        &self,
        handle: Handle,
        f: impl FnOnce(&RwLock<Box<[u8]>>) -> Result<R, BridgeError>,
    ) -> Result<R, BridgeError> {
        match &*self.block(handle)? {
            Block::Host(bytes) => f(bytes),
            Block::Batch(_) => Err(BridgeError::NotHostBlock(handle.as_raw())),
        }
    }

    /// Reserve `size` zeroed bytes.
    pub fn allocate(&self, size: usize) -> Result<Handle, BridgeError> {
        if size == 0 {
            return Err(BridgeError::InvalidSize(0));
        }
        if size > self.max_block_size {
            return Err(BridgeError::BlockTooLarge {
                size,
                limit: self.max_block_size,
            });
        }

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|_| BridgeError::AllocationFailed(size))?;
        bytes.resize(size, 0u8);

        let handle = self.next_handle();
        self.blocks.lock().insert(
            handle.as_raw(),
            Arc::new(Block::Host(RwLock::new(bytes.into_boxed_slice()))),
        );
        debug!(%handle, size, "Allocated block");
        Ok(handle)
    }

    /// Release a host block. The null handle is a no-op.
    pub fn free(&self, handle: Handle) -> Result<(), BridgeError> {
        if handle.is_null() {
            return Ok(());
        }
        let removed = {
            let mut blocks = self.blocks.lock();
            let is_batch = blocks
                .get(&handle.as_raw())
                .map(|b| matches!(**b, Block::Batch(_)));
            match is_batch {
                None => return Err(BridgeError::UnknownHandle(handle.as_raw())),
                Some(true) => return Err(BridgeError::NotHostBlock(handle.as_raw())),
                Some(false) => blocks.remove(&handle.as_raw()),
            }
        };
        drop(removed);
        debug!(%handle, "Freed block");
        Ok(())
    }

    /// Copy `src` into the block starting at offset 0.
    pub fn copy_in(&self, handle: Handle, src: &[u8]) -> Result<(), BridgeError> {
        self.copy_in_at(handle, 0, src)
    }

    pub fn copy_in_at(&self, handle: Handle, offset: usize, src: &[u8]) -> Result<(), BridgeError> {
        if handle.is_null() {
            return Ok(());
        }
        self.with_host(handle, |block| {
            let mut bytes = block.write();
            let r = range(handle, offset, src.len(), bytes.len())?;
            bytes[r].copy_from_slice(src);
            Ok(())
        })
    }

    /// Copy `len` bytes out of a host block.
    pub fn read_bytes(&self, handle: Handle, offset: usize, len: usize) -> Result<Vec<u8>, BridgeError> {
        if handle.is_null() {
            return Ok(Vec::new());
        }
        self.with_host(handle, |block| {
            let bytes = block.read();
            let r = range(handle, offset, len, bytes.len())?;
            Ok(bytes[r].to_vec())
        })
    }

    /// Write a native-endian `i64` at offset 0.
    pub fn write_integer(&self, handle: Handle, value: i64) -> Result<(), BridgeError> {
        self.write_integer_at(handle, 0, value)
    }

    pub fn write_integer_at(&self, handle: Handle, offset: usize, value: i64) -> Result<(), BridgeError> {
        self.copy_in_at(handle, offset, &value.to_ne_bytes())
    }

    /// Read a native-endian `i64` at offset 0. The null handle reads as 0.
    pub fn read_integer(&self, handle: Handle) -> Result<i64, BridgeError> {
        self.read_integer_at(handle, 0)
    }

    pub fn read_integer_at(&self, handle: Handle, offset: usize) -> Result<i64, BridgeError> {
        if handle.is_null() {
            return Ok(0);
        }
        self.with_host(handle, |block| {
            let bytes = block.read();
            let r = range(handle, offset, INTEGER_SIZE, bytes.len())?;
            Ok(bytemuck::pod_read_unaligned::<i64>(&bytes[r]))
        })
    }

    /// Copy `count` consecutive `f32`s from the start of a block.
    ///
    /// Empty on the null handle or when `count <= 0`.
    pub fn read_float_vector(&self, handle: Handle, count: i64) -> Result<Vec<f32>, BridgeError> {
        self.read_float_vector_at(handle, 0, count)
    }

    /// Copy `count` `f32`s starting `offset` bytes into a host block or batch.
    ///
    /// Batch offsets must be a multiple of 4.
    pub fn read_float_vector_at(
        &self,
        handle: Handle,
        offset: usize,
        count: i64,
    ) -> Result<Vec<f32>, BridgeError> {
        if handle.is_null() || count <= 0 {
            return Ok(Vec::new());
        }
        let count = usize::try_from(count).map_err(|_| BridgeError::InvalidSize(count))?;
        let byte_len = count
            .checked_mul(FLOAT_SIZE)
            .ok_or(BridgeError::InvalidSize(i64::MAX))?;

        match &*self.block(handle)? {
            Block::Host(block) => {
                let bytes = block.read();
                let r = range(handle, offset, byte_len, bytes.len())?;
                Ok(bytes[r]
                    .chunks_exact(FLOAT_SIZE)
                    .map(bytemuck::pod_read_unaligned::<f32>)
                    .collect())
            }
            Block::Batch(batch) => {
                if offset % FLOAT_SIZE != 0 {
                    return Err(BridgeError::Misaligned {
                        handle: handle.as_raw(),
                        offset,
                        align: FLOAT_SIZE,
                    });
                }
                let floats = batch.floats();
                range(handle, offset, byte_len, floats.len() * FLOAT_SIZE)?;
                let start = offset / FLOAT_SIZE;
                Ok(floats[start..start + count].to_vec())
            }
        }
    }

    /// Size of the block in bytes.
    pub fn block_size(&self, handle: Handle) -> Result<usize, BridgeError> {
        match &*self.block(handle)? {
            Block::Host(block) => Ok(block.read().len()),
            Block::Batch(batch) => Ok(batch.floats().len() * FLOAT_SIZE),
        }
    }

    /// Number of live blocks of either kind.
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Register an engine batch and return its handle.
    pub fn insert_batch(&self, batch: EngineBatch) -> Handle {
        let handle = self.next_handle();
        let (n_vectors, dim) = batch.shape();
        self.blocks
            .lock()
            .insert(handle.as_raw(), Arc::new(Block::Batch(batch)));
        debug!(%handle, n_vectors, dim, "Registered embedding batch");
        handle
    }

    /// `(n_vectors, dim)` of a registered batch.
    pub fn batch_shape(&self, handle: Handle) -> Result<(usize, usize), BridgeError> {
        match &*self.block(handle)? {
            Block::Batch(batch) => Ok(batch.shape()),
            Block::Host(_) => Err(BridgeError::NotBatch(handle.as_raw())),
        }
    }

    /// Unregister a batch. The engine destructor runs once the last reader
    /// has finished with it.
    pub fn remove_batch(&self, handle: Handle) -> Result<(), BridgeError> {
        if handle.is_null() {
            return Ok(());
        }
        let removed = {
            let mut blocks = self.blocks.lock();
            let is_batch = blocks
                .get(&handle.as_raw())
                .map(|b| matches!(**b, Block::Batch(_)));
            match is_batch {
                None => {
                    warn!(%handle, "Batch already released or never registered");
                    return Err(BridgeError::UnknownHandle(handle.as_raw()));
                }
                Some(false) => return Err(BridgeError::NotBatch(handle.as_raw())),
                Some(true) => blocks.remove(&handle.as_raw()),
            }
        };
        drop(removed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_zeroed() {
        let arena = BlockArena::default();
        for size in [1, 7, 64, 4096] {
            let h = arena.allocate(size).unwrap();
            assert!(!h.is_null());
            assert_eq!(arena.block_size(h).unwrap(), size);
            assert!(arena.read_bytes(h, 0, size).unwrap().iter().all(|&b| b == 0));
            arena.free(h).unwrap();
        }
        assert_eq!(arena.live_blocks(), 0);
    }

    #[test]
    fn test_allocate_invalid_sizes() {
        let arena = BlockArena::new(1024);
        assert_eq!(arena.allocate(0), Err(BridgeError::InvalidSize(0)));
        assert!(matches!(
            arena.allocate(2048),
            Err(BridgeError::BlockTooLarge { size: 2048, limit: 1024 })
        ));
        assert_eq!(arena.live_blocks(), 0);
    }

    #[test]
    fn test_handles_are_not_reused() {
        let arena = BlockArena::default();
        let a = arena.allocate(8).unwrap();
        arena.free(a).unwrap();
        let b = arena.allocate(8).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_null_handle_is_noop() {
        let arena = BlockArena::default();
        assert!(arena.free(Handle::NULL).is_ok());
        assert_eq!(arena.read_integer(Handle::NULL).unwrap(), 0);
        assert!(arena.write_integer(Handle::NULL, 5).is_ok());
        assert!(arena.copy_in(Handle::NULL, b"abc").is_ok());
        for n in [-1, 0, 1, 1000] {
            assert!(arena.read_float_vector(Handle::NULL, n).unwrap().is_empty());
        }
    }

    #[test]
    fn test_double_free_is_detected() {
        let arena = BlockArena::default();
        let h = arena.allocate(16).unwrap();
        arena.free(h).unwrap();
        assert_eq!(arena.free(h), Err(BridgeError::UnknownHandle(h.as_raw())));
    }

    #[test]
    fn test_copy_in_round_trip() {
        let arena = BlockArena::default();
        let h = arena.allocate(16).unwrap();
        arena.copy_in(h, b"hello, bridge").unwrap();
        assert_eq!(arena.read_bytes(h, 0, 13).unwrap(), b"hello, bridge");
        // the tail stays zeroed
        assert_eq!(arena.read_bytes(h, 13, 3).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn test_copy_in_out_of_bounds() {
        let arena = BlockArena::default();
        let h = arena.allocate(4).unwrap();
        let err = arena.copy_in(h, b"too long").unwrap_err();
        assert!(matches!(err, BridgeError::OutOfBounds { size: 4, len: 8, .. }));
        assert!(arena.copy_in_at(h, usize::MAX, b"x").is_err());
        // block untouched
        assert_eq!(arena.read_bytes(h, 0, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_integer_round_trip() {
        let arena = BlockArena::default();
        let h = arena.allocate(24).unwrap();
        for v in [0, 1, -1, 42, i64::MIN, i64::MAX] {
            arena.write_integer(h, v).unwrap();
            assert_eq!(arena.read_integer(h).unwrap(), v);
        }
        // unaligned offsets are fine for host blocks
        arena.write_integer_at(h, 3, -77).unwrap();
        assert_eq!(arena.read_integer_at(h, 3).unwrap(), -77);
        assert!(arena.read_integer_at(h, 17).is_err());
    }

    #[test]
    fn test_integer_needs_a_full_word() {
        let arena = BlockArena::default();
        let h = arena.allocate(4).unwrap();
        assert!(arena.write_integer(h, 1).is_err());
        assert!(arena.read_integer(h).is_err());
    }

    #[test]
    fn test_read_float_vector_from_host_block() {
        let arena = BlockArena::default();
        let values = [1.5f32, -2.0, 0.25];
        let h = arena.allocate(1 + values.len() * 4).unwrap();
        arena.copy_in_at(h, 1, bytemuck::cast_slice(&values)).unwrap();

        assert_eq!(arena.read_float_vector_at(h, 1, 3).unwrap(), values);
        assert!(arena.read_float_vector(h, 0).unwrap().is_empty());
        assert!(arena.read_float_vector(h, -3).unwrap().is_empty());
        assert!(arena.read_float_vector_at(h, 1, 4).is_err());
    }

    unsafe extern "C" fn leak_free(_batch: *mut EmbeddingBatch) {}

    #[test]
    fn test_batch_blocks_are_read_only() {
        let arena = BlockArena::default();
        let mut data = vec![0.5f32, 1.0, 1.5, 2.0];
        let raw = EmbeddingBatch {
            data: data.as_mut_ptr(),
            n_vectors: 2,
            dim: 2,
        };
        let h = arena.insert_batch(unsafe { EngineBatch::new(raw, leak_free) });

        assert_eq!(arena.batch_shape(h).unwrap(), (2, 2));
        assert_eq!(arena.block_size(h).unwrap(), 16);
        assert_eq!(arena.read_float_vector_at(h, 8, 2).unwrap(), vec![1.5, 2.0]);
        assert!(matches!(
            arena.read_float_vector_at(h, 2, 1),
            Err(BridgeError::Misaligned { .. })
        ));
        assert!(arena.read_float_vector_at(h, 8, 3).is_err());
        assert_eq!(arena.free(h), Err(BridgeError::NotHostBlock(h.as_raw())));
        assert_eq!(arena.write_integer(h, 1), Err(BridgeError::NotHostBlock(h.as_raw())));

        let host = arena.allocate(8).unwrap();
        assert_eq!(arena.remove_batch(host), Err(BridgeError::NotBatch(host.as_raw())));
        assert_eq!(arena.batch_shape(host), Err(BridgeError::NotBatch(host.as_raw())));

        arena.remove_batch(h).unwrap();
        assert_eq!(arena.remove_batch(h), Err(BridgeError::UnknownHandle(h.as_raw())));
        assert!(arena.remove_batch(Handle::NULL).is_ok());
    }

    #[test]
    fn test_concurrent_allocations() {
        let arena = Arc::new(BlockArena::default());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let arena = Arc::clone(&arena);
                std::thread::spawn(move || {
                    for j in 0..100i64 {
                        let h = arena.allocate(8).unwrap();
                        arena.write_integer(h, i * 1000 + j).unwrap();
                        assert_eq!(arena.read_integer(h).unwrap(), i * 1000 + j);
                        arena.free(h).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(arena.live_blocks(), 0);
    }
}
