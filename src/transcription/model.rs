//! # Acoustic Model
//!
//! The seam between the request pipeline and whatever network turns audio
//! into CTC logits.
//!
//! ## Inference Contract:
//! 1. `features`: normalized 16kHz mono samples → model input tensor
//! 2. `forward`: input tensor → logits shaped `[batch, frames, vocab]`
//! 3. `decode`: per-frame argmax ids → text
//!
//! Greedy argmax sits between steps 2 and 3 and lives in the engine, so a
//! model only has to describe its own input, network and vocabulary.
//!
//! ## Model Loading Process:
//! 1. Download `config.json`, `vocab.json` and `model.safetensors` from
//!    HuggingFace (cached locally after the first run)
//! 2. Build the CTC vocabulary
//! 3. Memory-map the weights onto the selected device

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use hf_hub::api::tokio::ApiBuilder;
use hf_hub::{Repo, RepoType};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::ModelConfig;
use crate::transcription::wav2vec2::{Wav2Vec2Config, Wav2Vec2ForCtc};

/// Variance floor used when normalizing input features.
pub const FEATURE_EPSILON: f32 = 1e-7;

/// A speech model that can be driven by the transcription engine.
///
/// ## Rust Concepts:
/// - **Send + Sync**: one instance is shared across request handlers and
///   blocking inference threads through an `Arc<dyn AcousticModel>`
/// - **&self everywhere**: inference never mutates the model, so no lock is
///   needed around it
pub trait AcousticModel: Send + Sync {
    /// Identifier reported by `/metrics` and startup logs.
    fn id(&self) -> &str;

    fn features(&self, samples: &[f32]) -> Result<Tensor>;

    fn forward(&self, features: &Tensor) -> Result<Tensor>;

    fn decode(&self, ids: &[u32]) -> Result<String>;
}

/// Zero-mean, unit-variance normalization of a waveform.
///
/// Silence (zero variance) maps to all zeros instead of dividing by zero.
pub fn normalize_features(samples: &[f32]) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }

    let n = samples.len() as f32;
    let mean = samples.iter().sum::<f32>() / n;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n;
    let scale = (variance + FEATURE_EPSILON).sqrt();

    samples.iter().map(|s| (s - mean) / scale).collect()
}

/// Character vocabulary for CTC output.
///
/// Built from a `vocab.json` token → id map. Decoding collapses consecutive
/// repeats, drops the blank token and special `<...>` tokens, and turns the
/// word delimiter into a space.
#[derive(Debug, Clone)]
pub struct CtcVocabulary {
    tokens: Vec<String>,
    blank_id: u32,
    word_delimiter: String,
}

impl CtcVocabulary {
    pub const BLANK_TOKEN: &'static str = "<pad>";
    pub const WORD_DELIMITER: &'static str = "|";

    pub fn from_json(json: &str) -> Result<Self> {
        let map: HashMap<String, u32> =
            serde_json::from_str(json).context("vocab.json is not a token -> id map")?;
        Self::from_map(map)
    }

    pub fn from_map(map: HashMap<String, u32>) -> Result<Self> {
        let size = map.values().max().map_or(0, |max| *max as usize + 1);
        if size == 0 {
            return Err(anyhow!("Vocabulary is empty"));
        }

        let mut tokens = vec![String::new(); size];
        for (token, id) in map {
            tokens[id as usize] = token;
        }

        let blank_id = tokens
            .iter()
            .position(|t| t == Self::BLANK_TOKEN)
            .map_or(0, |i| i as u32);

        Ok(Self {
            tokens,
            blank_id,
            word_delimiter: Self::WORD_DELIMITER.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn blank_id(&self) -> u32 {
        self.blank_id
    }

    pub fn decode(&self, ids: &[u32]) -> String {
        let mut text = String::new();
        let mut previous = None;

        for &id in ids {
            if previous == Some(id) {
                continue;
            }
            previous = Some(id);

            if id == self.blank_id {
                continue;
            }

            match self.tokens.get(id as usize) {
                Some(token) if *token == self.word_delimiter => text.push(' '),
                Some(token) if token.starts_with('<') && token.ends_with('>') => {}
                Some(token) => text.push_str(token),
                None => tracing::warn!("CTC id {} is outside the vocabulary", id),
            }
        }

        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// A wav2vec2 CTC checkpoint ready for inference.
pub struct Wav2Vec2Ctc {
    id: String,
    model: Wav2Vec2ForCtc,
    vocab: CtcVocabulary,
    device: Device,
}

impl Wav2Vec2Ctc {
    /// Fetch a checkpoint from HuggingFace and load it onto `device`.
    ///
    /// `HF_TOKEN` is used for gated repositories when set.
    pub async fn load(settings: &ModelConfig, device: Device) -> Result<Self> {
        tracing::info!(
            "Loading acoustic model {}@{}...",
            settings.repo,
            settings.revision
        );
        let start_time = std::time::Instant::now();

        let mut builder = ApiBuilder::new()
            .with_progress(false)
            .with_token(std::env::var("HF_TOKEN").ok());
        if !settings.cache_dir.is_empty() {
            tracing::debug!("Using hub cache dir: {}", settings.cache_dir);
            builder = builder.with_cache_dir(PathBuf::from(&settings.cache_dir));
        }
        let api = builder
            .build()
            .map_err(|e| anyhow!("Failed to initialise HuggingFace API: {}", e))?;

        let repo = api.repo(Repo::with_revision(
            settings.repo.clone(),
            RepoType::Model,
            settings.revision.clone(),
        ));

        let mut files = Vec::with_capacity(3);
        for name in ["config.json", "vocab.json", "model.safetensors"] {
            let path = repo
                .get(name)
                .await
                .map_err(|e| anyhow!("Failed to download {} from {}: {}", name, settings.repo, e))?;
            tracing::debug!("Fetched {} -> {:?}", name, path);
            files.push(path);
        }

        let model = Self::from_files(&settings.repo, &files[0], &files[1], &files[2], device)?;

        tracing::info!(
            "Acoustic model {} loaded in {:.2}s ({} tokens)",
            settings.repo,
            start_time.elapsed().as_secs_f64(),
            model.vocab.len()
        );

        Ok(model)
    }

    /// Load from already-downloaded files.
    pub fn from_files(
        id: &str,
        config_path: &Path,
        vocab_path: &Path,
        weights_path: &Path,
        device: Device,
    ) -> Result<Self> {
        let config: Wav2Vec2Config = serde_json::from_reader(std::fs::File::open(config_path)?)
            .context("Failed to parse model config.json")?;
        tracing::debug!("Model config: {:?}", config);

        let vocab = CtcVocabulary::from_json(&std::fs::read_to_string(vocab_path)?)?;
        if vocab.len() != config.vocab_size {
            tracing::warn!(
                "vocab.json has {} tokens but config declares {}",
                vocab.len(),
                config.vocab_size
            );
        }

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)? };
        let model = Wav2Vec2ForCtc::load(vb, &config)?;

        Ok(Self {
            id: id.to_string(),
            model,
            vocab,
            device,
        })
    }
}

impl AcousticModel for Wav2Vec2Ctc {
    fn id(&self) -> &str {
        &self.id
    }

    fn features(&self, samples: &[f32]) -> Result<Tensor> {
        let normalized = normalize_features(samples);
        let len = normalized.len();
        Ok(Tensor::from_vec(normalized, (1, len), &self.device)?)
    }

    fn forward(&self, features: &Tensor) -> Result<Tensor> {
        Ok(self.model.forward(features)?)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(self.vocab.decode(ids))
    }
}
