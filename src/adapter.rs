//! Embedding protocol adapter.
//!
//! Translates names and slice payloads into calls against the engine's C
//! contract and registers the engine's output batch in the bridge arena.
//! Every failure surfaces as a sentinel id or a [`GenerateError`] carrying
//! the engine's code unchanged; nothing here retries.
use std::ffi::CString;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLockReadGuard;
use tracing::{debug, warn};

use crate::engine::abi::{ByteSlice, EmbeddingBatch, EngineContract, InputData, Modality, StringSlice};
use crate::error::{BridgeError, GenerateError, INVALID_ID, STATUS_OK, Status};
use crate::memory::{self, Block, BlockArena, EngineBatch, Handle, SliceRef};

/// A modality-tagged input, as slices into bridge blocks.
///
/// The tag is not checked against the arrays here; the engine decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputPayload {
    pub modality: Modality,
    pub binary: Vec<SliceRef>,
    pub text: Vec<SliceRef>,
}

impl InputPayload {
    #[must_use]
    pub fn text(text: Vec<SliceRef>) -> Self {
        Self {
            modality: Modality::Text,
            binary: Vec::new(),
            text,
        }
    }

    #[must_use]
    pub fn image(binary: Vec<SliceRef>) -> Self {
        Self {
            modality: Modality::Image,
            binary,
            text: Vec::new(),
        }
    }

    #[must_use]
    pub fn multimodal(binary: Vec<SliceRef>, text: Vec<SliceRef>) -> Self {
        Self {
            modality: Modality::Multimodal,
            binary,
            text,
        }
    }
}

pub struct EmbeddingAdapter {
    arena: Arc<BlockArena>,
    engine: EngineContract,
}

static ADAPTER: OnceLock<EmbeddingAdapter> = OnceLock::new();

/// The adapter used by the C ABI: global arena, built-in engine.
pub fn global() -> &'static EmbeddingAdapter {
    ADAPTER.get_or_init(|| {
        EmbeddingAdapter::new(Arc::clone(memory::global()), EngineContract::builtin())
    })
}

fn ptr_or_null<T>(items: &[T]) -> *const T {
    if items.is_empty() {
        std::ptr::null()
    } else {
        items.as_ptr()
    }
}

impl EmbeddingAdapter {
    #[must_use]
    pub fn new(arena: Arc<BlockArena>, engine: EngineContract) -> Self {
        Self { arena, engine }
    }

    /// An adapter over a fresh arena and the built-in engine.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new(Arc::new(BlockArena::default()), EngineContract::builtin())
    }

    #[must_use]
    pub fn arena(&self) -> &Arc<BlockArena> {
        &self.arena
    }

    /// Resolve a method name to its id, or [`INVALID_ID`].
    #[must_use]
    pub fn validate_method(&self, name: &str) -> i32 {
        let Ok(name) = CString::new(name) else {
            return INVALID_ID;
        };
        unsafe { (self.engine.validate_method)(name.as_ptr()) }
    }

    /// Resolve a model name within `method_id` for `modality`.
    #[must_use]
    pub fn validate_model(&self, method_id: i32, name: &str, modality: Modality) -> i32 {
        if method_id < 0 {
            return INVALID_ID;
        }
        let Ok(name) = CString::new(name) else {
            return INVALID_ID;
        };
        unsafe { (self.engine.validate_model)(method_id, name.as_ptr(), modality.as_raw()) }
    }

    /// Legacy form of [`validate_model`](Self::validate_model) that assumes text input.
    #[must_use]
    pub fn validate_model_text(&self, method_id: i32, name: &str) -> i32 {
        self.validate_model(method_id, name, Modality::Text)
    }

    /// Run the engine's unified generate entry point over `payload`.
    ///
    /// On success the batch is registered in the arena and its handle
    /// returned; release it with [`release_batch`](Self::release_batch).
    pub fn generate(
        &self,
        method_id: i32,
        model_id: i32,
        payload: &InputPayload,
    ) -> Result<Handle, GenerateError> {
        debug!(
            method_id,
            model_id,
            modality = %payload.modality,
            n_binary = payload.binary.len(),
            n_text = payload.text.len(),
            "Dispatching generate"
        );

        // Pin every referenced block so a concurrent free cannot pull memory
        // out from under the engine.
        let mut pinned: Vec<(Handle, Arc<Block>)> = Vec::new();
        for slice in payload.binary.iter().chain(&payload.text) {
            if pinned.iter().any(|(h, _)| *h == slice.handle) {
                continue;
            }
            let block = self.arena.block(slice.handle).map_err(|e| {
                warn!("Rejecting payload slice: {e}");
                Status::InvalidArgument
            })?;
            pinned.push((slice.handle, block));
        }

        let mut guards: Vec<RwLockReadGuard<'_, Box<[u8]>>> = Vec::with_capacity(pinned.len());
        for (handle, block) in &pinned {
            match &**block {
                Block::Host(lock) => guards.push(lock.read()),
                Block::Batch(_) => {
                    warn!(%handle, "Payload slice points into an embedding batch");
                    return Err(GenerateError::Status(Status::InvalidArgument));
                }
            }
        }

        let view = |slice: &SliceRef| -> Result<(*const u8, usize), GenerateError> {
            let idx = pinned
                .iter()
                .position(|(h, _)| *h == slice.handle)
                .ok_or(Status::InvalidArgument)?;
            let bytes: &[u8] = &guards[idx];
            match slice.offset.checked_add(slice.len) {
                Some(end) if end <= bytes.len() => {
                    Ok((bytes[slice.offset..end].as_ptr(), slice.len))
                }
                _ => {
                    warn!(
                        "{}",
                        BridgeError::OutOfBounds {
                            handle: slice.handle.as_raw(),
                            offset: slice.offset,
                            len: slice.len,
                            size: bytes.len(),
                        }
                    );
                    Err(GenerateError::Status(Status::InvalidArgument))
                }
            }
        };

        let binary = payload
            .binary
            .iter()
            .map(|s| view(s).map(|(ptr, len)| ByteSlice { ptr, len }))
            .collect::<Result<Vec<_>, _>>()?;
        let text = payload
            .text
            .iter()
            .map(|s| {
                view(s).map(|(ptr, len)| StringSlice {
                    ptr: ptr.cast(),
                    len,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let input = InputData {
            input_type: payload.modality.as_raw(),
            binary_data: ptr_or_null(&binary),
            n_binary: binary.len(),
            text_data: ptr_or_null(&text),
            n_text: text.len(),
        };

        let mut out = EmbeddingBatch::empty();
        let code = unsafe { (self.engine.generate)(method_id, model_id, &input, &mut out) };
        drop(guards);

        if code != STATUS_OK {
            let err = GenerateError::from_engine(code);
            debug!(code, "Engine rejected generate: {err}");
            return Err(err);
        }

        let batch = unsafe { EngineBatch::new(out, self.engine.free_batch) };
        Ok(self.arena.insert_batch(batch))
    }

    /// [`generate`](Self::generate) over descriptor blocks, as a host sends it.
    #[allow(clippy::too_many_arguments)]
    pub fn generate_from_descriptors(
        &self,
        method_id: i32,
        model_id: i32,
        input_type: i32,
        binary: Handle,
        n_binary: usize,
        text: Handle,
        n_text: usize,
    ) -> Result<Handle, GenerateError> {
        let modality = Modality::from_raw(input_type).ok_or(Status::InvalidArgument)?;
        let binary = self.arena.read_descriptors(binary, n_binary)?;
        let text = self.arena.read_descriptors(text, n_text)?;
        self.generate(
            method_id,
            model_id,
            &InputPayload {
                modality,
                binary,
                text,
            },
        )
    }

    /// Legacy text-only generate: forwards with the Text modality.
    pub fn generate_from_texts(
        &self,
        method_id: i32,
        model_id: i32,
        text: Handle,
        n_text: usize,
    ) -> Result<Handle, GenerateError> {
        let text = self.arena.read_descriptors(text, n_text)?;
        self.generate(method_id, model_id, &InputPayload::text(text))
    }

    /// Release a batch returned by [`generate`](Self::generate).
    ///
    /// No-op on the null handle. A second release of the same handle reports
    /// [`BridgeError::UnknownHandle`] and never reaches the engine.
    pub fn release_batch(&self, handle: Handle) -> Result<(), BridgeError> {
        self.arena.remove_batch(handle)
    }

    pub fn batch_shape(&self, handle: Handle) -> Result<(usize, usize), BridgeError> {
        self.arena.batch_shape(handle)
    }
}
