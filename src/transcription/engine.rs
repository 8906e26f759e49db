//! # Transcription Engine
//!
//! Runs the acoustic model over a normalized waveform and returns text.
//!
//! ## Key Responsibilities:
//! - **Concurrency bound**: at most `max_concurrent_inferences` model passes
//!   run at once; further requests wait for a permit
//! - **Off the async runtime**: the forward pass is CPU/GPU bound, so it runs
//!   on tokio's blocking pool
//! - **Timeout**: a pass that outlives `inference_timeout_secs` is reported as
//!   a failure; the blocking thread finishes in the background and keeps its
//!   permit until then
//! - **Greedy CTC**: argmax per frame, then the model's own decoding

use candle_core::D;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::audio::NormalizedWaveform;
use crate::config::PerformanceConfig;
use crate::transcription::model::AcousticModel;

#[derive(Debug)]
pub enum InferenceError {
    /// Feature extraction, the forward pass or decoding failed
    Model(String),

    /// The pass did not finish within the configured timeout
    Timeout(Duration),

    /// The engine is shutting down or the worker thread died
    Unavailable(String),
}

impl fmt::Display for InferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceError::Model(msg) => write!(f, "Inference failed: {}", msg),
            InferenceError::Timeout(limit) => {
                write!(f, "Inference timed out after {}s", limit.as_secs_f64())
            }
            InferenceError::Unavailable(msg) => write!(f, "Inference unavailable: {}", msg),
        }
    }
}

impl std::error::Error for InferenceError {}

impl From<anyhow::Error> for InferenceError {
    fn from(err: anyhow::Error) -> Self {
        InferenceError::Model(err.to_string())
    }
}

impl From<candle_core::Error> for InferenceError {
    fn from(err: candle_core::Error) -> Self {
        InferenceError::Model(err.to_string())
    }
}

/// Shared inference front-end.
///
/// ## Thread Safety:
/// The model sits behind an `Arc` and is only ever borrowed immutably, so the
/// semaphore is the only synchronization needed.
pub struct TranscriptionEngine {
    model: Arc<dyn AcousticModel>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl TranscriptionEngine {
    pub fn new(model: Arc<dyn AcousticModel>, config: &PerformanceConfig) -> Self {
        Self {
            model,
            permits: Arc::new(Semaphore::new(config.max_concurrent_inferences)),
            timeout: config.inference_timeout(),
        }
    }

    pub fn model_id(&self) -> &str {
        self.model.id()
    }

    /// Transcribe one waveform.
    ///
    /// The permit moves into the blocking task, so it is released when the
    /// pass actually ends, even if the caller already gave up on a timeout.
    pub async fn transcribe(&self, waveform: NormalizedWaveform) -> Result<String, InferenceError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| InferenceError::Unavailable(e.to_string()))?;

        let model = Arc::clone(&self.model);
        let samples = waveform.samples;
        let start_time = Instant::now();

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            run_inference(model.as_ref(), &samples)
        });

        let text = match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => joined.map_err(|e| InferenceError::Unavailable(e.to_string()))??,
            Err(_) => {
                tracing::error!("Inference exceeded {:?}", self.timeout);
                return Err(InferenceError::Timeout(self.timeout));
            }
        };

        tracing::debug!(
            "Inference finished in {:.1}ms ({} chars)",
            start_time.elapsed().as_secs_f64() * 1000.0,
            text.len()
        );

        Ok(text)
    }
}

/// Synchronous pipeline: features → logits → argmax → text.
pub fn run_inference(model: &dyn AcousticModel, samples: &[f32]) -> Result<String, InferenceError> {
    let features = model.features(samples)?;
    let logits = model.forward(&features)?;

    let ids = logits.argmax(D::Minus1)?.squeeze(0)?.to_vec1::<u32>()?;
    tracing::trace!("CTC frames: {}", ids.len());

    Ok(model.decode(&ids)?)
}
