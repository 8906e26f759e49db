//! # Transcription Service
//!
//! Request-level pipeline behind `POST /asr`:
//!
//! 1. **Validate** the upload (present, named, right extension, non-empty)
//! 2. **Spool** the bytes to a uniquely named temporary file
//! 3. **Normalize** the file to 16kHz mono (duration measured before resampling)
//! 4. **Infer** through the shared [`TranscriptionEngine`]
//!
//! Validation failures are client errors. Anything after validation is an
//! internal error carrying the underlying message. The temporary file is
//! removed on every path, including failures.

use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use crate::audio::{normalize_file, DecodeError, NormalizedWaveform};
use crate::config::AudioConfig;
use crate::transcription::engine::{InferenceError, TranscriptionEngine};

/// An uploaded file as received from the multipart form.
#[derive(Debug, Clone)]
pub struct AudioPayload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Reasons an upload is rejected before any processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    NoFileProvided,
    NoFileSelected,
    /// Carries the expected format, e.g. `MP3`
    UnsupportedFormat(String),
    EmptyFile,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::NoFileProvided => write!(f, "No file provided"),
            ValidationError::NoFileSelected => write!(f, "No file selected"),
            ValidationError::UnsupportedFormat(format) => {
                write!(f, "File must be {} format", format)
            }
            ValidationError::EmptyFile => write!(f, "Uploaded file is empty"),
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
pub enum ServiceError {
    BadRequest(ValidationError),
    Internal(String),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::BadRequest(err) => write!(f, "{}", err),
            ServiceError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<ValidationError> for ServiceError {
    fn from(err: ValidationError) -> Self {
        ServiceError::BadRequest(err)
    }
}

impl From<DecodeError> for ServiceError {
    fn from(err: DecodeError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

impl From<InferenceError> for ServiceError {
    fn from(err: InferenceError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

/// Successful response body.
///
/// `duration` is a string on the wire (e.g. `"2.0"`), seconds of the
/// original clip before resampling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionResult {
    pub transcription: String,
    pub duration: String,
}

pub struct TranscriptionService {
    engine: Arc<TranscriptionEngine>,
    extension: String,
}

impl TranscriptionService {
    pub fn new(engine: Arc<TranscriptionEngine>, audio: &AudioConfig) -> Self {
        Self {
            engine,
            extension: audio.extension(),
        }
    }

    pub fn engine(&self) -> &TranscriptionEngine {
        &self.engine
    }

    /// Check an upload in the order clients see the errors.
    pub fn validate(&self, payload: Option<AudioPayload>) -> Result<AudioPayload, ValidationError> {
        let payload = payload.ok_or(ValidationError::NoFileProvided)?;

        if payload.filename.is_empty() {
            return Err(ValidationError::NoFileSelected);
        }

        let suffix = format!(".{}", self.extension);
        if !payload.filename.to_lowercase().ends_with(&suffix) {
            return Err(ValidationError::UnsupportedFormat(self.extension.to_uppercase()));
        }

        if payload.bytes.is_empty() {
            return Err(ValidationError::EmptyFile);
        }

        Ok(payload)
    }

    /// Validate, decode and transcribe one upload.
    pub async fn handle(
        &self,
        payload: Option<AudioPayload>,
    ) -> Result<TranscriptionResult, ServiceError> {
        let payload = match self.validate(payload) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("Rejected upload: {}", err);
                return Err(err.into());
            }
        };

        let filename = payload.filename.clone();
        let size = payload.bytes.len();

        match self.process(payload).await {
            Ok(result) => {
                tracing::info!(
                    "Transcribed {} ({} bytes, {}s): {} chars",
                    filename,
                    size,
                    result.duration,
                    result.transcription.len()
                );
                Ok(result)
            }
            Err(err) => {
                tracing::error!("Failed to transcribe {}: {}", filename, err);
                Err(err)
            }
        }
    }

    async fn process(&self, payload: AudioPayload) -> Result<TranscriptionResult, ServiceError> {
        let extension = self.extension.clone();
        let waveform = tokio::task::spawn_blocking(move || spool_and_normalize(payload, &extension))
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))??;

        let duration = format_duration(waveform.duration_secs);
        let transcription = self.engine.transcribe(waveform).await?;

        Ok(TranscriptionResult {
            transcription,
            duration,
        })
    }
}

/// Write the upload to a temporary file and normalize it from there.
///
/// The `NamedTempFile` deletes itself when dropped at the end of this scope.
fn spool_and_normalize(
    payload: AudioPayload,
    extension: &str,
) -> Result<NormalizedWaveform, ServiceError> {
    let mut spool = tempfile::Builder::new()
        .prefix("asr-upload-")
        .suffix(&format!(".{}", extension))
        .tempfile()?;

    spool.write_all(&payload.bytes)?;
    spool.flush()?;
    drop(payload);

    tracing::debug!("Spooled upload to {:?}", spool.path());

    Ok(normalize_file(spool.path())?)
}

/// Render seconds the way clients expect: always with a fractional part,
/// shortest round-trip digits (`2.0`, `4.284`, `0.5`).
pub fn format_duration(secs: f64) -> String {
    format!("{:?}", secs)
}
