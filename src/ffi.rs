//! C ABI exported to the host.
//!
//! Thin wrappers over the global arena and adapter. Every export returns a
//! sentinel instead of failing loudly, and panics are caught at the boundary.
use std::ffi::{CStr, c_char};
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, error, info, warn};

use crate::adapter;
use crate::config::Config;
use crate::engine::abi::Modality;
use crate::engine::native;
use crate::error::{GenerateError, INVALID_ID, STATUS_OK, Status};
use crate::memory::{self, Handle};

const INVALID_ARGUMENT: i32 = Status::InvalidArgument as i32;

/// Returned by [`gembed_init`] when the arena or registry already existed, so
/// part of the new configuration was not applied.
pub const ALREADY_INITIALISED: i32 = 1;

fn guarded<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!("Panic caught at the C boundary");
        fallback
    })
}

unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

unsafe fn byte_slice<'a>(ptr: *const u8, len: usize) -> Option<&'a [u8]> {
    match (ptr.is_null(), len) {
        (_, 0) => Some(&[]),
        (true, _) => None,
        (false, _) => Some(unsafe { std::slice::from_raw_parts(ptr, len) }),
    }
}

// ── Initialisation ───────────────────────────────────────────────────

/// Load configuration, install logging, size the arena and install the
/// reference engine's registry.
///
/// `config_path` may be null to use `$GEMBED_CONFIG` or `gembed.json`; a
/// missing file means defaults. Must run before any other export to take
/// effect. Returns 0 on success, -1 on an unreadable, unparseable or invalid
/// configuration, and [`ALREADY_INITIALISED`] when earlier calls already fixed
/// the arena or registry.
///
/// # Safety
///
/// `config_path` must be null or point to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gembed_init(config_path: *const c_char) -> i32 {
    let path = unsafe { c_str(config_path) }.unwrap_or_default().to_string();
    guarded(INVALID_ARGUMENT, move || {
        let config = match Config::load_strict(&path).and_then(|c| c.validate().map(|()| c)) {
            Ok(c) => c,
            Err(e) => {
                crate::logging::init(&Config::default().log_filter);
                error!("Failed to load configuration: {e:#}");
                return INVALID_ARGUMENT;
            }
        };

        crate::logging::init(&config.log_filter);
        let arena_applied = memory::configure(config.max_block_size);
        let registry_applied = native::install(&config);
        if !(arena_applied && registry_applied) {
            warn!(arena_applied, registry_applied, "Bridge already initialised");
            return ALREADY_INITIALISED;
        }
        info!("gembed {} initialised", env!("CARGO_PKG_VERSION"));
        STATUS_OK
    })
}

// ── Memory bridge ────────────────────────────────────────────────────

/// Allocate `size` zeroed bytes. Returns 0 on failure.
#[unsafe(no_mangle)]
pub extern "C" fn gembed_allocate(size: i64) -> u64 {
    guarded(0, || {
        let Ok(size) = usize::try_from(size) else {
            debug!(size, "Refusing negative allocation");
            return 0;
        };
        match memory::global().allocate(size) {
            Ok(handle) => handle.as_raw(),
            Err(e) => {
                warn!("Allocation failed: {e}");
                0
            }
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn gembed_free(handle: u64) {
    guarded((), || {
        if let Err(e) = memory::global().free(Handle::from_raw(handle)) {
            warn!("free refused: {e}");
        }
    });
}

/// Copy `len` bytes from `src` to the start of the block.
///
/// # Safety
///
/// `src` must be valid for `len` bytes of reads.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gembed_copy_in(handle: u64, src: *const u8, len: usize) -> i32 {
    unsafe { gembed_copy_in_at(handle, 0, src, len) }
}

/// # Safety
///
/// `src` must be valid for `len` bytes of reads.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gembed_copy_in_at(
    handle: u64,
    offset: usize,
    src: *const u8,
    len: usize,
) -> i32 {
    let Some(bytes) = (unsafe { byte_slice(src, len) }) else {
        return INVALID_ARGUMENT;
    };
    guarded(INVALID_ARGUMENT, || {
        match memory::global().copy_in_at(Handle::from_raw(handle), offset, bytes) {
            Ok(()) => STATUS_OK,
            Err(e) => {
                warn!("copy_in refused: {e}");
                INVALID_ARGUMENT
            }
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn gembed_write_integer(handle: u64, value: i64) {
    gembed_write_integer_at(handle, 0, value);
}

#[unsafe(no_mangle)]
pub extern "C" fn gembed_write_integer_at(handle: u64, offset: usize, value: i64) -> i32 {
    guarded(INVALID_ARGUMENT, || {
        match memory::global().write_integer_at(Handle::from_raw(handle), offset, value) {
            Ok(()) => STATUS_OK,
            Err(e) => {
                warn!("write_integer refused: {e}");
                INVALID_ARGUMENT
            }
        }
    })
}

/// Read the integer at the start of the block; 0 for the null handle or on
/// error.
#[unsafe(no_mangle)]
pub extern "C" fn gembed_read_integer(handle: u64) -> i64 {
    gembed_read_integer_at(handle, 0)
}

#[unsafe(no_mangle)]
pub extern "C" fn gembed_read_integer_at(handle: u64, offset: usize) -> i64 {
    guarded(0, || {
        memory::global()
            .read_integer_at(Handle::from_raw(handle), offset)
            .unwrap_or_else(|e| {
                warn!("read_integer refused: {e}");
                0
            })
    })
}

/// Copy `count` floats from the block into `out`.
///
/// Returns the number of floats written: 0 for the null handle or
/// `count <= 0`, -1 if `out` cannot hold them or the read is refused.
///
/// # Safety
///
/// `out` must be valid for `out_len` floats of writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gembed_read_float_vector(
    handle: u64,
    count: i64,
    out: *mut f32,
    out_len: usize,
) -> i64 {
    unsafe { gembed_read_float_vector_at(handle, 0, count, out, out_len) }
}

/// # Safety
///
/// `out` must be valid for `out_len` floats of writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gembed_read_float_vector_at(
    handle: u64,
    offset: usize,
    count: i64,
    out: *mut f32,
    out_len: usize,
) -> i64 {
    if handle == 0 || count <= 0 {
        return 0;
    }
    if out.is_null() || usize::try_from(count).map_or(true, |n| n > out_len) {
        return i64::from(INVALID_ARGUMENT);
    }
    let floats = guarded(None, || {
        memory::global()
            .read_float_vector_at(Handle::from_raw(handle), offset, count)
            .map_err(|e| warn!("read_float_vector refused: {e}"))
            .ok()
    });
    match floats {
        Some(floats) => {
            unsafe { std::ptr::copy_nonoverlapping(floats.as_ptr(), out, floats.len()) };
            floats.len() as i64
        }
        None => i64::from(INVALID_ARGUMENT),
    }
}

// ── Embedding protocol ───────────────────────────────────────────────

/// # Safety
///
/// `method` must be null or point to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gembed_validate_method(method: *const c_char) -> i32 {
    let Some(method) = (unsafe { c_str(method) }) else {
        return INVALID_ID;
    };
    guarded(INVALID_ID, || adapter::global().validate_method(method))
}

/// # Safety
///
/// `model` must be null or point to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gembed_validate_model(
    method_id: i32,
    model: *const c_char,
    input_type: i32,
) -> i32 {
    let (Some(model), Some(modality)) = (unsafe { c_str(model) }, Modality::from_raw(input_type))
    else {
        return INVALID_ID;
    };
    guarded(INVALID_ID, || {
        adapter::global().validate_model(method_id, model, modality)
    })
}

/// Legacy model validation without a modality; assumes text.
///
/// # Safety
///
/// `model` must be null or point to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gembed_validate_model_text(method_id: i32, model: *const c_char) -> i32 {
    let Some(model) = (unsafe { c_str(model) }) else {
        return INVALID_ID;
    };
    guarded(INVALID_ID, || {
        adapter::global().validate_model_text(method_id, model)
    })
}

/// Generate embeddings for a payload described by two descriptor blocks.
///
/// On success writes the batch handle to `out_batch` and returns 0. On
/// failure returns the adapter's status or the engine's own code unchanged,
/// and leaves `out_batch` untouched.
///
/// # Safety
///
/// `out_batch` must be null or valid for a `u64` write.
#[unsafe(no_mangle)]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn gembed_generate(
    method_id: i32,
    model_id: i32,
    input_type: i32,
    binary_descriptors: u64,
    n_binary: usize,
    text_descriptors: u64,
    n_text: usize,
    out_batch: *mut u64,
) -> i32 {
    if out_batch.is_null() {
        return INVALID_ARGUMENT;
    }
    let result = guarded(Err(GenerateError::Status(Status::GenerationFailed)), || {
        adapter::global().generate_from_descriptors(
            method_id,
            model_id,
            input_type,
            Handle::from_raw(binary_descriptors),
            n_binary,
            Handle::from_raw(text_descriptors),
            n_text,
        )
    });
    if let Ok(handle) = &result {
        unsafe { out_batch.write(handle.as_raw()) };
    }
    GenerateError::code_of(&result)
}

/// Legacy text-only generation.
///
/// # Safety
///
/// `out_batch` must be null or valid for a `u64` write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gembed_generate_from_texts(
    method_id: i32,
    model_id: i32,
    text_descriptors: u64,
    n_text: usize,
    out_batch: *mut u64,
) -> i32 {
    if out_batch.is_null() {
        return INVALID_ARGUMENT;
    }
    let result = guarded(Err(GenerateError::Status(Status::GenerationFailed)), || {
        adapter::global().generate_from_texts(
            method_id,
            model_id,
            Handle::from_raw(text_descriptors),
            n_text,
        )
    });
    if let Ok(handle) = &result {
        unsafe { out_batch.write(handle.as_raw()) };
    }
    GenerateError::code_of(&result)
}

/// Release a batch. No-op on 0 and on an already released handle.
#[unsafe(no_mangle)]
pub extern "C" fn gembed_release_batch(handle: u64) {
    guarded((), || {
        if let Err(e) = adapter::global().release_batch(Handle::from_raw(handle)) {
            debug!("release_batch ignored: {e}");
        }
    });
}

/// Write a batch's shape to `out_n_vectors` / `out_dim`.
///
/// # Safety
///
/// Both out pointers must be null or valid for a `usize` write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gembed_batch_shape(
    handle: u64,
    out_n_vectors: *mut usize,
    out_dim: *mut usize,
) -> i32 {
    if out_n_vectors.is_null() || out_dim.is_null() {
        return INVALID_ARGUMENT;
    }
    let shape = guarded(None, || {
        adapter::global()
            .batch_shape(Handle::from_raw(handle))
            .map_err(|e| debug!("batch_shape refused: {e}"))
            .ok()
    });
    match shape {
        Some((n_vectors, dim)) => {
            unsafe {
                out_n_vectors.write(n_vectors);
                out_dim.write(dim);
            }
            STATUS_OK
        }
        None => INVALID_ARGUMENT,
    }
}
