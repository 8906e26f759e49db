//! # Configuration Management
//!
//! Loads the settings shared by the transcription server and the batch decoder
//! from several sources, merged in priority order:
//!
//! 1. Environment variables (`APP_SERVER__PORT`, `APP_BATCH__SERVICE_URL`, ...)
//! 2. An optional `config.toml` next to the working directory
//! 3. Built-in defaults (the `Default` impl below)
//!
//! `HOST` and `PORT` are honoured as well for deployment platforms that only
//! hand those two out.
//!
//! ## Sections:
//! - **server**: where the HTTP service binds
//! - **model**: which acoustic model to fetch and on which device to run it
//! - **audio**: upload acceptance rules
//! - **performance**: inference concurrency and per-request timeout
//! - **batch**: manifest, audio root and service URL for `cv-decode`

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::batch::MergePolicy;

/// Top-level configuration.
///
/// ## Rust Concepts:
/// - **#[derive(Serialize, Deserialize)]**: the `config` crate round-trips the
///   defaults through serde, so every section must support both directions
/// - **Clone**: the server hands a copy to each worker factory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Acoustic model selection.
///
/// `repo` is a Hugging Face model id holding `config.json`, `vocab.json`
/// and `model.safetensors`. `device` is one of `auto`, `cpu`, `cuda`, `metal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub repo: String,
    pub revision: String,
    pub device: String,
    /// Hub cache directory; empty means the hf-hub default
    pub cache_dir: String,
}

/// Upload acceptance rules for `POST /asr`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// The single accepted file extension, without the dot (e.g. `mp3`)
    pub accepted_extension: String,

    /// Uploads larger than this are rejected before any processing
    pub max_upload_bytes: usize,
}

/// Inference tuning.
///
/// ## Throughput constraint:
/// At most `max_concurrent_inferences` requests run the model at the same
/// time; the rest wait for a permit. Each inference is abandoned after
/// `inference_timeout_secs` and reported as an internal error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_inferences: usize,
    pub inference_timeout_secs: u64,
}

/// Settings for the `cv-decode` batch driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Base URL of a running transcription service
    pub service_url: String,

    /// CSV manifest with a `filename` column; rewritten in place
    pub manifest_path: PathBuf,

    /// Directory the manifest's filenames are relative to
    pub audio_root: PathBuf,

    pub merge_policy: MergePolicy,

    /// Per-request HTTP timeout for the batch client
    pub request_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8001,
            },
            model: ModelConfig {
                repo: "facebook/wav2vec2-large-960h".to_string(),
                revision: "main".to_string(),
                device: "auto".to_string(),
                cache_dir: String::new(),
            },
            audio: AudioConfig {
                accepted_extension: "mp3".to_string(),
                max_upload_bytes: 50 * 1024 * 1024, // 50MB
            },
            performance: PerformanceConfig {
                max_concurrent_inferences: 4,
                inference_timeout_secs: 120,
            },
            batch: BatchConfig {
                service_url: "http://localhost:8001".to_string(),
                manifest_path: PathBuf::from("cv-valid-dev.csv"),
                audio_root: PathBuf::from("cv-valid-dev"),
                merge_policy: MergePolicy::Overwrite,
                request_timeout_secs: 300,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`
    /// - `APP_MODEL__REPO=facebook/wav2vec2-base-960h`
    /// - `APP_BATCH__MERGE_POLICY=preserve_on_failure`
    /// - `HOST=0.0.0.0`, `PORT=3000`
    ///
    /// Nested keys use a double underscore so that field names containing a
    /// single underscore (`max_upload_bytes`) survive the mapping.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.accepted_extension.trim_start_matches('.').is_empty() {
            return Err(anyhow::anyhow!("Accepted audio extension cannot be empty"));
        }

        if self.audio.max_upload_bytes == 0 {
            return Err(anyhow::anyhow!("Max upload size must be greater than 0"));
        }

        if self.performance.max_concurrent_inferences == 0 {
            return Err(anyhow::anyhow!("Max concurrent inferences must be greater than 0"));
        }

        if self.performance.inference_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Inference timeout must be greater than 0"));
        }

        if self.batch.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Batch request timeout must be greater than 0"));
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl AudioConfig {
    /// The accepted extension normalised to lowercase without a leading dot.
    pub fn extension(&self) -> String {
        self.accepted_extension.trim_start_matches('.').to_lowercase()
    }
}

impl PerformanceConfig {
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }
}

impl BatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
