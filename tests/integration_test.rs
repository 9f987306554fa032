/// End-to-end integration tests for the gembed bridge.
///
/// Drives the C ABI the way a host does:
///   allocate → copy_in → write descriptors → validate → generate → read → release
///
/// All tests share the process-wide arena, so assertions are made per handle
/// rather than on global block counts.
use std::ffi::CString;

use gembed::adapter;
use gembed::client::{ClientError, EmbeddingGenerator};
use gembed::config::{Config, MethodConfig, ModelConfig};
use gembed::engine::Modality;
use gembed::engine::registry::Registry;
use gembed::error::{INVALID_ID, STATUS_OK, Status};
use gembed::ffi::*;
use gembed::memory::DESCRIPTOR_SIZE;
use tempfile::tempdir;

const TEXT: i32 = 0;
const IMAGE: i32 = 1;
const MULTIMODAL: i32 = 2;

/// Host-side payload: one block per item plus a descriptor block.
struct HostPayload {
    blocks: Vec<u64>,
    descriptors: u64,
}

impl HostPayload {
    fn new(items: &[&[u8]]) -> Self {
        let mut blocks = Vec::new();
        for item in items {
            let h = gembed_allocate(item.len().max(1) as i64);
            assert_ne!(h, 0);
            assert_eq!(unsafe { gembed_copy_in(h, item.as_ptr(), item.len()) }, STATUS_OK);
            blocks.push(h);
        }

        let descriptors = if items.is_empty() {
            0
        } else {
            gembed_allocate((items.len() * DESCRIPTOR_SIZE) as i64)
        };
        for (i, (h, item)) in blocks.iter().zip(items).enumerate() {
            let base = i * DESCRIPTOR_SIZE;
            assert_eq!(gembed_write_integer_at(descriptors, base, *h as i64), STATUS_OK);
            assert_eq!(gembed_write_integer_at(descriptors, base + 8, 0), STATUS_OK);
            assert_eq!(
                gembed_write_integer_at(descriptors, base + 16, item.len() as i64),
                STATUS_OK
            );
        }
        Self {
            blocks,
            descriptors,
        }
    }

    fn texts(texts: &[&str]) -> Self {
        let items: Vec<&[u8]> = texts.iter().map(|t| t.as_bytes()).collect();
        Self::new(&items)
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }
}

impl Drop for HostPayload {
    fn drop(&mut self) {
        for h in self.blocks.drain(..) {
            gembed_free(h);
        }
        gembed_free(self.descriptors);
    }
}

fn method_id(name: &str) -> i32 {
    let name = CString::new(name).unwrap();
    unsafe { gembed_validate_method(name.as_ptr()) }
}

fn model_id(method: i32, name: &str, input_type: i32) -> i32 {
    let name = CString::new(name).unwrap();
    unsafe { gembed_validate_model(method, name.as_ptr(), input_type) }
}

fn generate(
    method: i32,
    model: i32,
    input_type: i32,
    binary: &HostPayload,
    text: &HostPayload,
) -> Result<u64, i32> {
    let mut out = u64::MAX;
    let code = unsafe {
        gembed_generate(
            method,
            model,
            input_type,
            binary.descriptors,
            binary.len(),
            text.descriptors,
            text.len(),
            &mut out,
        )
    };
    if code == STATUS_OK {
        Ok(out)
    } else {
        assert_eq!(out, u64::MAX, "out_batch must stay untouched on failure");
        Err(code)
    }
}

fn shape(batch: u64) -> Option<(usize, usize)> {
    let (mut n, mut dim) = (0usize, 0usize);
    (unsafe { gembed_batch_shape(batch, &mut n, &mut dim) } == STATUS_OK).then_some((n, dim))
}

fn read_all(batch: u64, count: usize) -> Vec<f32> {
    let mut out = vec![f32::NAN; count];
    let written =
        unsafe { gembed_read_float_vector(batch, count as i64, out.as_mut_ptr(), out.len()) };
    assert_eq!(written, count as i64);
    out
}

/// Full text flow: validate → generate → read → release
#[test]
fn test_text_generation_pipeline() {
    let method = method_id("cosine");
    assert_eq!(method, 0);
    let model = model_id(method, "mini-v1", TEXT);
    assert_eq!(model, 0);

    let texts = HostPayload::texts(&["hello", "world"]);
    let none = HostPayload::new(&[]);
    let batch = generate(method, model, TEXT, &none, &texts).unwrap();
    assert_ne!(batch, 0);
    assert_eq!(shape(batch), Some((2, 384)));

    let floats = read_all(batch, 2 * 384);
    assert!(floats.iter().all(|f| f.is_finite()));
    for row in floats.chunks(384) {
        let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "row norm was {norm}");
    }
    assert_ne!(floats[..384], floats[384..], "different texts, different vectors");

    gembed_release_batch(batch);
    assert_eq!(shape(batch), None);
    // second release is a no-op
    gembed_release_batch(batch);
    gembed_release_batch(0);
}

#[test]
fn test_generation_is_deterministic() {
    let texts = HostPayload::texts(&["same input"]);
    let none = HostPayload::new(&[]);
    let a = generate(0, 0, TEXT, &none, &texts).unwrap();
    let b = generate(0, 0, TEXT, &none, &texts).unwrap();
    assert_ne!(a, b, "every batch gets a fresh handle");
    assert_eq!(read_all(a, 384), read_all(b, 384));
    gembed_release_batch(a);
    gembed_release_batch(b);
}

#[test]
fn test_three_texts() {
    let texts = HostPayload::texts(&["a", "b", ""]);
    let none = HostPayload::new(&[]);
    let batch = generate(0, 0, TEXT, &none, &texts).unwrap();
    assert_eq!(shape(batch), Some((3, 384)));
    gembed_release_batch(batch);
}

#[test]
fn test_empty_text_input_is_rejected() {
    let none = HostPayload::new(&[]);
    assert_eq!(
        generate(0, 0, TEXT, &none, &none),
        Err(Status::EmptyInput.code())
    );
}

#[test]
fn test_validation_rejects_unknown_names() {
    assert_eq!(method_id("does-not-exist"), INVALID_ID);
    assert_eq!(method_id(""), INVALID_ID);
    assert_eq!(model_id(0, "does-not-exist", TEXT), INVALID_ID);
    assert_eq!(model_id(INVALID_ID, "mini-v1", TEXT), INVALID_ID);
    assert_eq!(model_id(0, "mini-v1", IMAGE), INVALID_ID);
    assert_eq!(model_id(0, "mini-v1", 7), INVALID_ID);
    assert_eq!(method_id("fastembed"), 1);
    assert_eq!(model_id(1, "bge-small-en-v1.5", TEXT), 0);
}

#[test]
fn test_invalid_model_id_in_generate() {
    let texts = HostPayload::texts(&["x"]);
    let none = HostPayload::new(&[]);
    assert_eq!(
        generate(0, 99, TEXT, &none, &texts),
        Err(Status::InvalidModel.code())
    );
    assert_eq!(
        generate(INVALID_ID, 0, TEXT, &none, &texts),
        Err(Status::InvalidModel.code())
    );
    assert_eq!(
        generate(0, 0, 9, &none, &texts),
        Err(Status::InvalidArgument.code())
    );
}

#[test]
fn test_image_and_multimodal_generation() {
    let clip = model_id(0, "clip-v1", IMAGE);
    assert_ne!(clip, INVALID_ID);
    assert_eq!(model_id(0, "clip-v1", MULTIMODAL), clip);

    let images = HostPayload::new(&[&[0x89, b'P', b'N', b'G'], &[1, 2, 3]]);
    let captions = HostPayload::texts(&["a cat", "a dog"]);
    let none = HostPayload::new(&[]);

    let batch = generate(0, clip, IMAGE, &images, &none).unwrap();
    assert_eq!(shape(batch), Some((2, 512)));
    gembed_release_batch(batch);

    let batch = generate(0, clip, MULTIMODAL, &images, &captions).unwrap();
    assert_eq!(shape(batch), Some((2, 512)));
    gembed_release_batch(batch);
}

#[test]
fn test_modality_mismatch() {
    let clip = model_id(0, "clip-v1", IMAGE);
    let images = HostPayload::new(&[&[1, 2, 3]]);
    let captions = HostPayload::texts(&["one", "two"]);
    let none = HostPayload::new(&[]);

    assert_eq!(
        generate(0, clip, IMAGE, &none, &captions),
        Err(Status::ModalityMismatch.code())
    );
    assert_eq!(
        generate(0, clip, TEXT, &images, &captions),
        Err(Status::ModalityMismatch.code())
    );
    assert_eq!(
        generate(0, clip, MULTIMODAL, &images, &captions),
        Err(Status::ModalityMismatch.code())
    );
    // text-only model asked for images
    assert_eq!(
        generate(0, 0, IMAGE, &images, &none),
        Err(Status::InvalidModel.code())
    );
}

#[test]
fn test_invalid_utf8_text() {
    let bad = HostPayload::new(&[&[0xff, 0xfe]]);
    let none = HostPayload::new(&[]);
    assert_eq!(
        generate(0, 0, TEXT, &none, &bad),
        Err(Status::InvalidUtf8.code())
    );
}

#[test]
fn test_descriptor_pointing_at_freed_block() {
    let texts = HostPayload::texts(&["gone"]);
    gembed_free(texts.blocks[0]);
    let none = HostPayload::new(&[]);
    assert_eq!(
        generate(0, 0, TEXT, &none, &texts),
        Err(Status::InvalidArgument.code())
    );
}

#[test]
fn test_descriptor_out_of_bounds() {
    let texts = HostPayload::texts(&["abc"]);
    assert_eq!(gembed_write_integer_at(texts.descriptors, 16, 64), STATUS_OK);
    let none = HostPayload::new(&[]);
    assert_eq!(
        generate(0, 0, TEXT, &none, &texts),
        Err(Status::InvalidArgument.code())
    );
}

#[test]
fn test_legacy_entry_points() {
    let mini = CString::new("mini-v1").unwrap();
    let model = unsafe { gembed_validate_model_text(0, mini.as_ptr()) };
    assert_eq!(model, 0);

    let texts = HostPayload::texts(&["legacy"]);
    let mut out = 0u64;
    let code = unsafe {
        gembed_generate_from_texts(0, model, texts.descriptors, texts.len(), &mut out)
    };
    assert_eq!(code, STATUS_OK);
    assert_eq!(shape(out), Some((1, 384)));
    gembed_release_batch(out);
}

#[test]
fn test_memory_round_trips() {
    let h = gembed_allocate(16);
    assert_ne!(h, 0);
    assert_eq!(gembed_read_integer(h), 0, "allocation is zeroed");
    assert_eq!(gembed_read_integer_at(h, 8), 0);

    let value: i64 = -0x0102_0304_0506_0708;
    let bytes = value.to_ne_bytes();
    assert_eq!(unsafe { gembed_copy_in(h, bytes.as_ptr(), bytes.len()) }, STATUS_OK);
    assert_eq!(gembed_read_integer(h), value);

    gembed_write_integer(h, 42);
    assert_eq!(gembed_read_integer(h), 42);

    // out of bounds writes are refused and leave the block intact
    assert_eq!(gembed_write_integer_at(h, 12, 7), Status::InvalidArgument.code());
    assert_eq!(gembed_read_integer_at(h, 8), 0);

    gembed_free(h);
    assert_eq!(gembed_read_integer(h), 0);
}

#[test]
fn test_free_refuses_batches() {
    let texts = HostPayload::texts(&["keep me"]);
    let none = HostPayload::new(&[]);
    let batch = generate(0, 0, TEXT, &none, &texts).unwrap();
    gembed_free(batch);
    assert_eq!(shape(batch), Some((1, 384)), "free must not release a batch");
    gembed_release_batch(batch);
    assert_eq!(shape(batch), None);
}

/// Host client: scoped inputs and batches
#[test]
fn test_client_generator() {
    let adapter = adapter::global();
    let generator = EmbeddingGenerator::new(adapter, "cosine", "mini-v1").unwrap();

    let batch = generator.generate_embeddings(&["one", "two"]).unwrap();
    assert_eq!(batch.num_vectors(), 2);
    assert_eq!(batch.dimension(), 384);
    let handle = batch.handle();
    let first = batch.get(0).unwrap();
    assert_eq!(first.len(), 384);
    assert!(matches!(batch.get(2), Err(ClientError::IndexOutOfRange { .. })));
    drop(batch);
    assert_eq!(shape(handle.as_raw()), None, "dropping releases the batch");

    assert!(matches!(
        generator.generate_embeddings(&[]),
        Err(ClientError::EmptyInput)
    ));
    assert!(matches!(
        EmbeddingGenerator::new(adapter, "cosine", "nope"),
        Err(ClientError::InvalidModel { .. })
    ));
}

/// Config file → registry ids
#[test]
fn test_config_driven_registry() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gembed.json");
    let path = path.to_str().unwrap();

    let mut config = Config::default();
    config.methods.push(MethodConfig {
        name: "custom".to_string(),
        models: vec![
            ModelConfig::new("tiny", 8, vec![Modality::Text]),
            ModelConfig::new("vision", 16, vec![Modality::Image, Modality::Multimodal]),
        ],
    });
    config.save(path).unwrap();

    let loaded = Config::load(path).unwrap();
    loaded.validate().unwrap();
    let registry = Registry::from_config(&loaded);

    let custom = registry.method_id("custom");
    assert_eq!(custom as usize, loaded.methods.len() - 1);
    assert_eq!(registry.model_id(custom, "tiny", Modality::Text), 0);
    assert_eq!(registry.model_id(custom, "vision", Modality::Image), 1);
    assert_eq!(registry.model_id(custom, "vision", Modality::Text), INVALID_ID);
    assert_eq!(registry.model(custom, 1).unwrap().dimensions(), 16);
}
