//! Pipeline configuration: one serde section per component.
//!
//! Every section defaults sensibly, so an empty JSON object (or no file at
//! all) yields a working configuration. `validate` rejects values that would
//! make a component misbehave rather than fail.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::discovery::ScanConfig;
use crate::pipeline::extraction::{EmbeddedMediaConfig, OcrConfig, TextGateConfig};
use crate::pipeline::resilience::{BreakerConfig, BreakerRegistry, CallGuard, RetryConfig};
use crate::pipeline::schema::SchemaConfig;
use crate::pipeline::storage::{ChunkingConfig, EmbeddingConfig};

/// Breaker names, one per external dependency.
pub const OCR_DEPENDENCY: &str = "ocr";
pub const EMBEDDING_DEPENDENCY: &str = "embedding";
pub const STORAGE_DEPENDENCY: &str = "storage";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Breaker thresholds plus one retry policy per call site family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub ocr: RetryConfig,
    pub embedding: RetryConfig,
    pub storage: RetryConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            ocr: RetryConfig::default(),
            embedding: RetryConfig::default(),
            storage: RetryConfig::default(),
        }
    }
}

impl ResilienceConfig {
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
        }
    }

    /// Fresh registry; callers own it and share it between guards.
    pub fn registry(&self) -> BreakerRegistry {
        BreakerRegistry::new(self.breaker_config())
    }

    pub fn gate_guard(&self, registry: &BreakerRegistry) -> CallGuard {
        CallGuard::for_dependency("text_gate.ocr", self.ocr.to_policy(), registry, OCR_DEPENDENCY)
    }

    pub fn ocr_guard(&self, registry: &BreakerRegistry) -> CallGuard {
        CallGuard::for_dependency("ocr.recognize", self.ocr.to_policy(), registry, OCR_DEPENDENCY)
    }

    pub fn embedding_guard(&self, registry: &BreakerRegistry) -> CallGuard {
        CallGuard::for_dependency(
            "embedding.model",
            self.embedding.to_policy(),
            registry,
            EMBEDDING_DEPENDENCY,
        )
    }

    pub fn storage_guard(&self, registry: &BreakerRegistry) -> CallGuard {
        CallGuard::for_dependency(
            "storage.put",
            self.storage.to_policy(),
            registry,
            STORAGE_DEPENDENCY,
        )
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub scan: ScanConfig,
    pub text_gate: TextGateConfig,
    pub ocr: OcrConfig,
    pub embedded: EmbeddedMediaConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub schema: SchemaConfig,
    pub resilience: ResilienceConfig,
}

// ═══════════════════════════════════════════════════════════
// Loading
// ═══════════════════════════════════════════════════════════

impl PipelineConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&raw)?;
        tracing::info!(path = %path.display(), "Pipeline config loaded");
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by `ASSET_ENRICH_CONFIG`, or defaults when
    /// the variable is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(crate::config::CONFIG_ENV_VAR) {
            Some(path) => Self::load(Path::new(&path)),
            None => {
                tracing::debug!("No pipeline config file set, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let gate = &self.text_gate;
        if !(0.0..=1.0).contains(&gate.edge_density_threshold) {
            return Err(invalid(format!(
                "text_gate.edge_density_threshold must be within [0, 1], got {}",
                gate.edge_density_threshold
            )));
        }
        check_percent("text_gate.word_confidence_threshold", gate.word_confidence_threshold)?;
        check_percent("ocr.acceptance_threshold", self.ocr.acceptance_threshold)?;

        if self.ocr.language.trim().is_empty() || gate.language.trim().is_empty() {
            return Err(invalid("OCR language must not be empty".into()));
        }
        if self.embedded.max_nesting_depth == 0 {
            return Err(invalid("embedded.max_nesting_depth must be at least 1".into()));
        }
        if self.embedded.max_image_bytes == 0 {
            return Err(invalid("embedded.max_image_bytes must be positive".into()));
        }

        let chunking = &self.chunking;
        if chunking.max_chunk_chars == 0 || chunking.overlap_chars >= chunking.max_chunk_chars {
            return Err(invalid(format!(
                "chunking.overlap_chars ({}) must be below max_chunk_chars ({})",
                chunking.overlap_chars, chunking.max_chunk_chars
            )));
        }

        if self.embedding.expected_dimension == 0 {
            return Err(invalid("embedding.expected_dimension must be positive".into()));
        }
        if self.embedding.batch_size == 0 {
            return Err(invalid("embedding.batch_size must be positive".into()));
        }

        if self.schema.max_depth == 0 || self.schema.sample_size == 0 {
            return Err(invalid("schema.max_depth and schema.sample_size must be positive".into()));
        }

        let resilience = &self.resilience;
        if resilience.failure_threshold == 0 {
            return Err(invalid("resilience.failure_threshold must be at least 1".into()));
        }
        for (site, retry) in [
            ("ocr", &resilience.ocr),
            ("embedding", &resilience.embedding),
            ("storage", &resilience.storage),
        ] {
            if retry.max_attempts == 0 {
                return Err(invalid(format!("resilience.{site}.max_attempts must be at least 1")));
            }
            if retry.base_delay_ms > retry.max_delay_ms {
                return Err(invalid(format!(
                    "resilience.{site}.base_delay_ms exceeds max_delay_ms"
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid(message)
}

fn check_percent(name: &str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be within [0, 100], got {value}")))
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
