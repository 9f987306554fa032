//! Built-in reference engine exported under the engine contract's symbols.
//!
//! Hosts that link a different engine never touch this module: the adapter
//! only reaches it through [`EngineContract::builtin`](super::abi::EngineContract::builtin).
use std::ffi::{CStr, c_char, c_int};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::OnceLock;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{INVALID_ID, STATUS_OK, Status};

use super::abi::{ByteSlice, EmbeddingBatch, InputData, Modality, StringSlice};
use super::registry::{ModelEntry, Registry};

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Install the registry described by `config`.
///
/// Returns `false` if the engine was already initialised, in which case the
/// existing registry stays in effect.
pub fn install(config: &Config) -> bool {
    let installed = REGISTRY.set(Registry::from_config(config)).is_ok();
    if installed {
        info!(
            methods = config.methods.len(),
            "Reference engine registry installed"
        );
    } else {
        debug!("Reference engine already initialised, keeping existing registry");
    }
    installed
}

/// The active registry, initialised with defaults on first use.
pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry::from_config(&Config::default()))
}

unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// # Safety
///
/// `method` must be null or point to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn validate_embedding_method(method: *const c_char) -> c_int {
    match unsafe { c_str(method) } {
        Some(name) => registry().method_id(name),
        None => INVALID_ID,
    }
}

/// # Safety
///
/// `model` must be null or point to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn validate_embedding_model(
    method_id: c_int,
    model: *const c_char,
    input_type: c_int,
) -> c_int {
    let Some(modality) = Modality::from_raw(input_type) else {
        return INVALID_ID;
    };
    match unsafe { c_str(model) } {
        Some(name) => registry().model_id(method_id, name, modality),
        None => INVALID_ID,
    }
}

/// Generate embeddings for `input` into `out_batch`.
///
/// Returns 0 on success. On failure `out_batch` is left untouched.
///
/// # Safety
///
/// `input` and `out_batch` must be null or valid for reads/writes; every slice
/// array and slice referenced by `input` must be valid for its stated length
/// for the duration of the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn generate_embeddings(
    method_id: c_int,
    model_id: c_int,
    input: *const InputData,
    out_batch: *mut EmbeddingBatch,
) -> c_int {
    if input.is_null() || out_batch.is_null() {
        return Status::InvalidArgument.code();
    }
    let input = unsafe { &*input };

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        generate(registry(), method_id, model_id, input)
    }));

    match result {
        Ok(Ok(batch)) => {
            debug!(
                method_id,
                model_id,
                n_vectors = batch.n_vectors,
                dim = batch.dim,
                "Generated embedding batch"
            );
            unsafe { out_batch.write(batch) };
            STATUS_OK
        }
        Ok(Err(status)) => {
            debug!(method_id, model_id, code = status.code(), "Generation rejected: {status}");
            status.code()
        }
        Err(_) => {
            error!(method_id, model_id, "Embedding generation panicked");
            Status::GenerationFailed.code()
        }
    }
}

/// Release the data owned by `batch` and reset it to the empty state.
///
/// Calling this again on the same (now empty) struct is a no-op.
///
/// # Safety
///
/// `batch` must be null or point to a batch populated by
/// [`generate_embeddings`] (or an empty batch).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free_embedding_batch(batch: *mut EmbeddingBatch) {
    if batch.is_null() {
        return;
    }
    let batch = unsafe { &mut *batch };
    if batch.data.is_null() {
        return;
    }
    // `len()` cannot overflow here: the same product was allocated.
    let len = batch.len().unwrap_or(0);
    drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(batch.data, len)) });
    *batch = EmbeddingBatch::empty();
}

unsafe fn generate(
    registry: &Registry,
    method_id: c_int,
    model_id: c_int,
    input: &InputData,
) -> Result<EmbeddingBatch, Status> {
    let modality = Modality::from_raw(input.input_type).ok_or(Status::InvalidArgument)?;
    let model = registry
        .model(method_id, model_id)
        .ok_or(Status::InvalidModel)?;
    if !model.supports(modality) {
        return Err(Status::InvalidModel);
    }

    let binary = unsafe { slice_array(input.binary_data, input.n_binary) }?;
    let text = unsafe { slice_array(input.text_data, input.n_text) }?;

    let vectors = match modality {
        Modality::Text => {
            if !binary.is_empty() {
                return Err(Status::ModalityMismatch);
            }
            if text.is_empty() {
                return Err(Status::EmptyInput);
            }
            let texts = text
                .iter()
                .map(|s| unsafe { text_of(s) })
                .collect::<Result<Vec<_>, _>>()?;
            model.embedder.embed_batch(&texts).map_err(embed_failed)?
        }
        Modality::Image => {
            if !text.is_empty() {
                return Err(Status::ModalityMismatch);
            }
            if binary.is_empty() {
                return Err(Status::EmptyInput);
            }
            binary
                .iter()
                .map(|b| {
                    let bytes = unsafe { bytes_of(b.ptr, b.len) }?;
                    model.embedder.embed_bytes(bytes).map_err(embed_failed)
                })
                .collect::<Result<Vec<_>, _>>()?
        }
        Modality::Multimodal => {
            if binary.len() != text.len() {
                return Err(Status::ModalityMismatch);
            }
            if text.is_empty() {
                return Err(Status::EmptyInput);
            }
            binary
                .iter()
                .zip(text)
                .map(|(b, t)| unsafe { fuse(model, b, t) })
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    into_batch(vectors, model.dimensions())
}

unsafe fn slice_array<'a, T>(ptr: *const T, n: usize) -> Result<&'a [T], Status> {
    if n == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(Status::InvalidArgument);
    }
    Ok(unsafe { std::slice::from_raw_parts(ptr, n) })
}

unsafe fn bytes_of<'a>(ptr: *const u8, len: usize) -> Result<&'a [u8], Status> {
    unsafe { slice_array(ptr, len) }
}

unsafe fn text_of<'a>(slice: &StringSlice) -> Result<&'a str, Status> {
    let bytes = unsafe { bytes_of(slice.ptr.cast::<u8>(), slice.len) }?;
    std::str::from_utf8(bytes).map_err(|_| Status::InvalidUtf8)
}

/// Mean of the image and text vectors, renormalised.
unsafe fn fuse(model: &ModelEntry, binary: &ByteSlice, text: &StringSlice) -> Result<Vec<f32>, Status> {
    let bytes = unsafe { bytes_of(binary.ptr, binary.len) }?;
    let text = unsafe { text_of(text) }?;
    let image_vec = model.embedder.embed_bytes(bytes).map_err(embed_failed)?;
    let text_vec = model.embedder.embed(text).map_err(embed_failed)?;

    let mut fused: Vec<f32> = image_vec
        .iter()
        .zip(&text_vec)
        .map(|(a, b)| (a + b) * 0.5)
        .collect();
    crate::embedder::l2_normalize(&mut fused);
    Ok(fused)
}

fn embed_failed(err: crate::embedder::EmbedderError) -> Status {
    warn!("Embedder failed: {err}");
    Status::GenerationFailed
}

fn into_batch(vectors: Vec<Vec<f32>>, dim: usize) -> Result<EmbeddingBatch, Status> {
    if vectors.iter().any(|v| v.len() != dim) {
        error!(dim, "Embedder returned a vector of unexpected length");
        return Err(Status::GenerationFailed);
    }

    let n_vectors = vectors.len();
    let total = n_vectors
        .checked_mul(dim)
        .ok_or(Status::AllocationFailed)?;
    let mut data = Vec::new();
    data.try_reserve_exact(total)
        .map_err(|_| Status::AllocationFailed)?;
    for v in vectors {
        data.extend_from_slice(&v);
    }

    let data = Box::into_raw(data.into_boxed_slice()).cast::<f32>();
    Ok(EmbeddingBatch {
        data,
        n_vectors,
        dim,
    })
}
