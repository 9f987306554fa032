//! Host-side client over the bridge and adapter.
//!
//! Does what a managed-runtime host does mechanically: copy inputs into
//! native blocks, describe them with slice descriptors, call generate, read
//! the batch back and release everything. Blocks and batches are freed on
//! drop.
use thiserror::Error;
use tracing::warn;

use crate::adapter::EmbeddingAdapter;
use crate::engine::abi::Modality;
use crate::error::{BridgeError, GenerateError};
use crate::memory::{BlockArena, Handle, SliceRef};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid embedding method: {0}")]
    InvalidMethod(String),

    #[error("model not allowed: {model} (method {method}, {modality} input)")]
    InvalidModel {
        method: String,
        model: String,
        modality: Modality,
    },

    #[error("input cannot be empty")]
    EmptyInput,

    #[error("embedding generation failed with code {code}: {0}", code = .0.code())]
    Generation(GenerateError),

    #[error("index {index} out of range for batch of {len} vectors")]
    IndexOutOfRange { index: usize, len: usize },

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Native copies of a list of inputs plus their descriptor block.
pub struct NativeInputs<'a> {
    arena: &'a BlockArena,
    blocks: Vec<Handle>,
    descriptors: Handle,
    count: usize,
}

impl<'a> NativeInputs<'a> {
    pub fn from_texts(arena: &'a BlockArena, texts: &[&str]) -> Result<Self, BridgeError> {
        Self::from_bytes(arena, texts.iter().map(|t| t.as_bytes()))
    }

    /// Copy each item into its own block.
    ///
    /// Empty items get a one-byte block and a zero-length slice.
    pub fn from_bytes<I, B>(arena: &'a BlockArena, items: I) -> Result<Self, BridgeError>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut inputs = Self {
            arena,
            blocks: Vec::new(),
            descriptors: Handle::NULL,
            count: 0,
        };

        let mut slices = Vec::new();
        for item in items {
            let bytes = item.as_ref();
            let handle = arena.allocate(bytes.len().max(1))?;
            inputs.blocks.push(handle);
            arena.copy_in(handle, bytes)?;
            slices.push(SliceRef::prefix(handle, bytes.len()));
        }

        inputs.descriptors = arena.write_descriptors(&slices)?;
        inputs.count = slices.len();
        Ok(inputs)
    }

    #[must_use]
    pub fn descriptors(&self) -> Handle {
        self.descriptors
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Drop for NativeInputs<'_> {
    fn drop(&mut self) {
        for handle in std::iter::once(self.descriptors).chain(self.blocks.drain(..)) {
            if let Err(e) = self.arena.free(handle) {
                warn!("Failed to free input block: {e}");
            }
        }
    }
}

/// A generated batch. Released through the adapter on drop.
pub struct Embeddings<'a> {
    adapter: &'a EmbeddingAdapter,
    handle: Handle,
    n_vectors: usize,
    dim: usize,
}

impl<'a> Embeddings<'a> {
    fn new(adapter: &'a EmbeddingAdapter, handle: Handle) -> Result<Self, ClientError> {
        let (n_vectors, dim) = match adapter.batch_shape(handle) {
            Ok(shape) => shape,
            Err(e) => {
                let _ = adapter.release_batch(handle);
                return Err(e.into());
            }
        };
        Ok(Self {
            adapter,
            handle,
            n_vectors,
            dim,
        })
    }

    #[must_use]
    pub fn num_vectors(&self) -> usize {
        self.n_vectors
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dim
    }

    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// All vectors, one row per input.
    pub fn all(&self) -> Result<Vec<Vec<f32>>, ClientError> {
        if self.dim == 0 {
            return Ok(vec![Vec::new(); self.n_vectors]);
        }
        let total = float_count(self.n_vectors * self.dim)?;
        let flat = self.adapter.arena().read_float_vector(self.handle, total)?;
        Ok(flat.chunks(self.dim).map(<[f32]>::to_vec).collect())
    }

    /// The vector at `index`.
    pub fn get(&self, index: usize) -> Result<Vec<f32>, ClientError> {
        if index >= self.n_vectors {
            return Err(ClientError::IndexOutOfRange {
                index,
                len: self.n_vectors,
            });
        }
        let offset = index * self.dim * size_of::<f32>();
        Ok(self
            .adapter
            .arena()
            .read_float_vector_at(self.handle, offset, float_count(self.dim)?)?)
    }
}

impl Drop for Embeddings<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.adapter.release_batch(self.handle) {
            warn!("Failed to release embedding batch: {e}");
        }
    }
}

fn float_count(n: usize) -> Result<i64, BridgeError> {
    i64::try_from(n).map_err(|_| BridgeError::InvalidSize(i64::MAX))
}

/// Validated method/model pair bound to an adapter.
pub struct EmbeddingGenerator<'a> {
    adapter: &'a EmbeddingAdapter,
    method: String,
    model: String,
    method_id: i32,
    model_id: i32,
}

impl<'a> EmbeddingGenerator<'a> {
    /// Validate `method`, then `model` for text input.
    pub fn new(adapter: &'a EmbeddingAdapter, method: &str, model: &str) -> Result<Self, ClientError> {
        let method_id = adapter.validate_method(method);
        if method_id < 0 {
            return Err(ClientError::InvalidMethod(method.to_string()));
        }

        let mut generator = Self {
            adapter,
            method: method.to_string(),
            model: model.to_string(),
            method_id,
            model_id: -1,
        };
        generator.model_id = generator.model_id_for(Modality::Text)?;
        Ok(generator)
    }

    fn model_id_for(&self, modality: Modality) -> Result<i32, ClientError> {
        let id = self
            .adapter
            .validate_model(self.method_id, &self.model, modality);
        if id < 0 {
            return Err(ClientError::InvalidModel {
                method: self.method.clone(),
                model: self.model.clone(),
                modality,
            });
        }
        Ok(id)
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embed a list of texts.
    pub fn generate_embeddings(&self, texts: &[&str]) -> Result<Embeddings<'a>, ClientError> {
        if texts.is_empty() {
            return Err(ClientError::EmptyInput);
        }
        let inputs = NativeInputs::from_texts(self.adapter.arena(), texts)?;
        self.dispatch(self.model_id, Modality::Text, None, Some(&inputs))
    }

    /// Embed a list of binary images.
    pub fn generate_image_embeddings(&self, images: &[&[u8]]) -> Result<Embeddings<'a>, ClientError> {
        if images.is_empty() {
            return Err(ClientError::EmptyInput);
        }
        let model_id = self.model_id_for(Modality::Image)?;
        let inputs = NativeInputs::from_bytes(self.adapter.arena(), images.iter().copied())?;
        self.dispatch(model_id, Modality::Image, Some(&inputs), None)
    }

    /// Embed image/caption pairs into one fused vector per pair.
    pub fn generate_multimodal_embeddings(
        &self,
        images: &[&[u8]],
        captions: &[&str],
    ) -> Result<Embeddings<'a>, ClientError> {
        if images.is_empty() && captions.is_empty() {
            return Err(ClientError::EmptyInput);
        }
        let model_id = self.model_id_for(Modality::Multimodal)?;
        let binary = NativeInputs::from_bytes(self.adapter.arena(), images.iter().copied())?;
        let text = NativeInputs::from_texts(self.adapter.arena(), captions)?;
        self.dispatch(model_id, Modality::Multimodal, Some(&binary), Some(&text))
    }

    /// Embed a single text.
    pub fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, ClientError> {
        self.generate_embeddings(&[text])?.get(0)
    }

    fn dispatch(
        &self,
        model_id: i32,
        modality: Modality,
        binary: Option<&NativeInputs<'_>>,
        text: Option<&NativeInputs<'_>>,
    ) -> Result<Embeddings<'a>, ClientError> {
        let parts = |inputs: Option<&NativeInputs<'_>>| {
            inputs.map_or((Handle::NULL, 0), |i| (i.descriptors(), i.len()))
        };
        let (binary, n_binary) = parts(binary);
        let (text, n_text) = parts(text);

        let handle = self
            .adapter
            .generate_from_descriptors(
                self.method_id,
                model_id,
                modality.as_raw(),
                binary,
                n_binary,
                text,
                n_text,
            )
            .map_err(ClientError::Generation)?;
        Embeddings::new(self.adapter, handle)
    }
}

/// One-shot helper: validate, embed `texts`, and copy the vectors out.
pub fn embed(
    adapter: &EmbeddingAdapter,
    method: &str,
    model: &str,
    texts: &[&str],
) -> Result<Vec<Vec<f32>>, ClientError> {
    let generator = EmbeddingGenerator::new(adapter, method, model)?;
    generator.generate_embeddings(texts)?.all()
}
