//! Configuration module for gembed.
//!
//! Handles loading, validating, and providing default configuration values
//! for the memory bridge and the reference engine's method/model registry.
use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::abi::Modality;

/// Environment variable consulted when no config path is given.
pub const CONFIG_ENV: &str = "GEMBED_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "gembed.json";

// ── Default value functions ──────────────────────────────────────────

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_max_block_size() -> usize {
    256 * 1024 * 1024
}

fn default_dimensions() -> usize {
    384
}

fn default_modalities() -> Vec<Modality> {
    vec![Modality::Text]
}

fn default_methods() -> Vec<MethodConfig> {
    vec![
        MethodConfig {
            name: "cosine".to_string(),
            models: vec![
                ModelConfig::new("mini-v1", 384, vec![Modality::Text]),
                ModelConfig::new(
                    "clip-v1",
                    512,
                    vec![Modality::Text, Modality::Image, Modality::Multimodal],
                ),
            ],
        },
        MethodConfig {
            name: "fastembed".to_string(),
            models: vec![ModelConfig::new(
                "bge-small-en-v1.5",
                384,
                vec![Modality::Text],
            )],
        },
    ]
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// `tracing` filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Largest block the bridge will allocate, in bytes.
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,

    #[serde(default = "default_methods")]
    pub methods: Vec<MethodConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MethodConfig {
    pub name: String,

    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ModelConfig {
    pub name: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_modalities")]
    pub modalities: Vec<Modality>,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            max_block_size: default_max_block_size(),
            methods: default_methods(),
        }
    }
}

impl ModelConfig {
    #[must_use]
    pub fn new(name: &str, dimensions: usize, modalities: Vec<Modality>) -> Self {
        Self {
            name: name.to_string(),
            dimensions,
            modalities,
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, falls back to `$GEMBED_CONFIG` and then to
    /// `"gembed.json"`. A missing file yields the default configuration; a
    /// file that fails to parse is reported and also yields the defaults.
    pub fn load(config_path: &str) -> Result<Self> {
        Self::read(config_path, false)
    }

    /// Like [`load`](Self::load), but a file that fails to parse is an error.
    pub fn load_strict(config_path: &str) -> Result<Self> {
        Self::read(config_path, true)
    }

    fn read(config_path: &str, strict: bool) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV).ok();
        let path = match (config_path.is_empty(), env_path.as_deref()) {
            (false, _) => config_path,
            (true, Some(p)) if !p.is_empty() => p,
            _ => DEFAULT_CONFIG_FILE,
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) if strict => {
                return Err(e).with_context(|| format!("invalid JSON in {path}"));
            }
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_block_size > 0, "max_block_size must be positive");
        anyhow::ensure!(
            !self.methods.is_empty(),
            "at least one embedding method must be configured"
        );

        let mut method_names = HashSet::new();
        for method in &self.methods {
            anyhow::ensure!(!method.name.is_empty(), "method name must not be empty");
            anyhow::ensure!(
                method_names.insert(method.name.as_str()),
                "duplicate method: {}",
                method.name
            );

            let mut model_names = HashSet::new();
            for model in &method.models {
                anyhow::ensure!(
                    !model.name.is_empty(),
                    "model name must not be empty (method {})",
                    method.name
                );
                anyhow::ensure!(
                    model_names.insert(model.name.as_str()),
                    "duplicate model {} in method {}",
                    model.name,
                    method.name
                );
                anyhow::ensure!(
                    model.dimensions > 0,
                    "model {} dimensions must be positive",
                    model.name
                );
                anyhow::ensure!(
                    !model.modalities.is_empty(),
                    "model {} must support at least one modality",
                    model.name
                );
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
