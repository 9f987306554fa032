//! C-compatible layouts shared with the native engine.
//!
//! Both sides read these structs straight out of memory, so field order and
//! sizes must match the engine's header exactly:
//!
//! ```c
//! typedef struct { const char *ptr; size_t len; } StringSlice;
//! typedef struct { const unsigned char *ptr; size_t len; } ByteSlice;
//! typedef struct {
//!     int input_type;
//!     const ByteSlice *binary_data;
//!     size_t n_binary;
//!     const StringSlice *text_data;
//!     size_t n_text;
//! } InputData;
//! typedef struct { float *data; size_t n_vectors; size_t dim; } EmbeddingBatch;
//! ```
use std::ffi::{c_char, c_int};
use std::ptr;

use serde::{Deserialize, Serialize};

pub const INPUT_TYPE_TEXT: c_int = 0;
pub const INPUT_TYPE_IMAGE: c_int = 1;
pub const INPUT_TYPE_MULTIMODAL: c_int = 2;

/// Input modality carried in `InputData::input_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Multimodal,
}

impl Modality {
    #[must_use]
    pub fn from_raw(raw: c_int) -> Option<Self> {
        match raw {
            INPUT_TYPE_TEXT => Some(Self::Text),
            INPUT_TYPE_IMAGE => Some(Self::Image),
            INPUT_TYPE_MULTIMODAL => Some(Self::Multimodal),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_raw(self) -> c_int {
        match self {
            Self::Text => INPUT_TYPE_TEXT,
            Self::Image => INPUT_TYPE_IMAGE,
            Self::Multimodal => INPUT_TYPE_MULTIMODAL,
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Multimodal => "multimodal",
        };
        f.write_str(name)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StringSlice {
    pub ptr: *const c_char,
    pub len: usize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ByteSlice {
    pub ptr: *const u8,
    pub len: usize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InputData {
    pub input_type: c_int,
    pub binary_data: *const ByteSlice,
    pub n_binary: usize,
    pub text_data: *const StringSlice,
    pub n_text: usize,
}

/// Engine-owned output: `n_vectors` rows of `dim` floats, row-major.
#[repr(C)]
#[derive(Debug)]
pub struct EmbeddingBatch {
    pub data: *mut f32,
    pub n_vectors: usize,
    pub dim: usize,
}

impl EmbeddingBatch {
    /// An unpopulated batch, as handed to the engine before generation.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            data: ptr::null_mut(),
            n_vectors: 0,
            dim: 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_null()
    }

    /// Total number of floats, or `None` on overflow.
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        self.n_vectors.checked_mul(self.dim)
    }
}

impl Default for EmbeddingBatch {
    fn default() -> Self {
        Self::empty()
    }
}

pub type ValidateMethodFn = unsafe extern "C" fn(method: *const c_char) -> c_int;
pub type ValidateModelFn =
    unsafe extern "C" fn(method_id: c_int, model: *const c_char, input_type: c_int) -> c_int;
pub type GenerateFn = unsafe extern "C" fn(
    method_id: c_int,
    model_id: c_int,
    input: *const InputData,
    out_batch: *mut EmbeddingBatch,
) -> c_int;
pub type FreeBatchFn = unsafe extern "C" fn(batch: *mut EmbeddingBatch);

/// The engine's fixed function contract.
///
/// The adapter only ever reaches an engine through these four entry points.
#[derive(Clone, Copy)]
pub struct EngineContract {
    pub validate_method: ValidateMethodFn,
    pub validate_model: ValidateModelFn,
    pub generate: GenerateFn,
    pub free_batch: FreeBatchFn,
}

impl EngineContract {
    /// The contract bound to the built-in reference engine.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            validate_method: super::native::validate_embedding_method,
            validate_model: super::native::validate_embedding_model,
            generate: super::native::generate_embeddings,
            free_batch: super::native::free_embedding_batch,
        }
    }
}

impl std::fmt::Debug for EngineContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContract").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn test_slice_layout() {
        assert_eq!(size_of::<StringSlice>(), 2 * size_of::<usize>());
        assert_eq!(size_of::<ByteSlice>(), 2 * size_of::<usize>());
        assert_eq!(offset_of!(StringSlice, len), size_of::<usize>());
    }

    #[test]
    fn test_input_data_field_order() {
        assert_eq!(offset_of!(InputData, input_type), 0);
        assert_eq!(offset_of!(InputData, binary_data), align_of::<*const ByteSlice>());
        assert!(offset_of!(InputData, n_binary) > offset_of!(InputData, binary_data));
        assert!(offset_of!(InputData, text_data) > offset_of!(InputData, n_binary));
        assert!(offset_of!(InputData, n_text) > offset_of!(InputData, text_data));
    }

    #[test]
    fn test_embedding_batch_layout() {
        assert_eq!(size_of::<EmbeddingBatch>(), 3 * size_of::<usize>());
        assert_eq!(offset_of!(EmbeddingBatch, n_vectors), size_of::<usize>());
        assert_eq!(offset_of!(EmbeddingBatch, dim), 2 * size_of::<usize>());
    }

    #[test]
    fn test_modality_raw_values() {
        for m in [Modality::Text, Modality::Image, Modality::Multimodal] {
            assert_eq!(Modality::from_raw(m.as_raw()), Some(m));
        }
        assert_eq!(Modality::from_raw(3), None);
        assert_eq!(Modality::from_raw(-1), None);
    }

    #[test]
    fn test_modality_serde() {
        let json = serde_json::to_string(&Modality::Multimodal).unwrap();
        assert_eq!(json, "\"multimodal\"");
        let parsed: Modality = serde_json::from_str("\"image\"").unwrap();
        assert_eq!(parsed, Modality::Image);
    }

    #[test]
    fn test_empty_batch() {
        let batch = EmbeddingBatch::empty();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), Some(0));
    }
}
