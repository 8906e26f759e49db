//! # ASR Backend
//!
//! Speech recognition over HTTP plus a batch decoder that drives it.
//!
//! ## Application Architecture:
//! - **config**: layered configuration shared by both binaries
//! - **audio**: decoding uploads into 16kHz mono waveforms
//! - **transcription**: acoustic model, inference engine, request pipeline
//! - **handlers** / **health**: HTTP endpoints
//! - **middleware**: request logging and metrics
//! - **state**: shared application state and counters
//! - **batch**: CSV manifest decoding against a running service
//! - **error**: HTTP error responses

pub mod audio;
pub mod batch;
pub mod config;
pub mod device;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod state;
pub mod transcription;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the given default filter, e.g.
/// `RUST_LOG=asr_backend=trace,actix_web=debug`.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
