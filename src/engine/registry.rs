//! Method/model registry of the reference engine.
//!
//! Method ids are positions in the configured method list; model ids are
//! positions within their method. Both are stable for the registry's lifetime.
use std::sync::Arc;

use crate::config::{Config, MethodConfig};
use crate::embedder::Embedder;
use crate::embedder::hash::HashEmbedder;
use crate::error::INVALID_ID;

use super::abi::Modality;

/// A model registered under a method.
pub struct ModelEntry {
    pub name: String,
    pub modalities: Vec<Modality>,
    pub embedder: Arc<dyn Embedder>,
}

impl ModelEntry {
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    #[must_use]
    pub fn supports(&self, modality: Modality) -> bool {
        self.modalities.contains(&modality)
    }
}

pub struct MethodEntry {
    pub name: String,
    pub models: Vec<ModelEntry>,
}

pub struct Registry {
    methods: Vec<MethodEntry>,
}

impl Registry {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            methods: config.methods.iter().map(method_entry).collect(),
        }
    }

    #[must_use]
    pub fn methods(&self) -> &[MethodEntry] {
        &self.methods
    }

    /// Look up a method by name, returning its id or [`INVALID_ID`].
    #[must_use]
    pub fn method_id(&self, name: &str) -> i32 {
        if name.is_empty() {
            return INVALID_ID;
        }
        self.methods
            .iter()
            .position(|m| m.name == name)
            .and_then(|i| i32::try_from(i).ok())
            .unwrap_or(INVALID_ID)
    }

    /// Look up a model within a method's namespace for the given modality.
    #[must_use]
    pub fn model_id(&self, method_id: i32, name: &str, modality: Modality) -> i32 {
        let Some(method) = self.method(method_id) else {
            return INVALID_ID;
        };
        method
            .models
            .iter()
            .position(|m| m.name == name && m.supports(modality))
            .and_then(|i| i32::try_from(i).ok())
            .unwrap_or(INVALID_ID)
    }

    #[must_use]
    pub fn method(&self, method_id: i32) -> Option<&MethodEntry> {
        usize::try_from(method_id)
            .ok()
            .and_then(|i| self.methods.get(i))
    }

    #[must_use]
    pub fn model(&self, method_id: i32, model_id: i32) -> Option<&ModelEntry> {
        let method = self.method(method_id)?;
        usize::try_from(model_id)
            .ok()
            .and_then(|i| method.models.get(i))
    }
}

fn method_entry(method: &MethodConfig) -> MethodEntry {
    let models = method
        .models
        .iter()
        .map(|model| ModelEntry {
            name: model.name.clone(),
            modalities: model.modalities.clone(),
            embedder: Arc::new(HashEmbedder::new(
                model.dimensions,
                &format!("{}/{}", method.name, model.name),
            )),
        })
        .collect();

    MethodEntry {
        name: method.name.clone(),
        models,
    }
}
