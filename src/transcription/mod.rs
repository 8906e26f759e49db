//! # Transcription Module
//!
//! Speech-to-text over normalized waveforms using a CTC acoustic model run
//! with Candle-rs.
//!
//! ## Key Components:
//! - **Acoustic Model**: the [`AcousticModel`] seam plus the wav2vec2 implementation
//! - **Transcription Engine**: bounded, time-limited greedy CTC inference
//! - **Transcription Service**: upload validation and the full request pipeline
//!
//! ## Default Model:
//! `facebook/wav2vec2-large-960h`, an English character-level CTC model
//! trained on LibriSpeech. Any wav2vec2 CTC checkpoint with `vocab.json` and
//! `model.safetensors` can be configured instead.

pub mod engine; // Permit-bounded inference
pub mod model; // Model trait, vocabulary and loading
pub mod service; // Request pipeline behind POST /asr
pub mod wav2vec2; // Network definition

pub use engine::{InferenceError, TranscriptionEngine};
pub use model::{AcousticModel, CtcVocabulary, Wav2Vec2Ctc};
pub use service::{
    AudioPayload, ServiceError, TranscriptionResult, TranscriptionService, ValidationError,
};
