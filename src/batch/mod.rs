//! # Batch Decoding
//!
//! Drives a running transcription service over every clip listed in a CSV
//! manifest and writes the transcripts back into that manifest.
//!
//! ## Flow:
//! 1. Load the manifest fully into memory
//! 2. For each record, in order, upload `audio_root/filename` to `POST /asr`
//! 3. Merge per-record outcomes into the `generated_text` column
//! 4. Persist the manifest atomically over the original path
//!
//! A failed record never stops the run: it ends up as an empty transcript
//! and an error log line. Only manifest-level problems abort.

pub mod client;
pub mod manifest;
pub mod orchestrator;

pub use client::{HttpTranscriptionClient, TranscriptionClient};
pub use manifest::{LineEnding, Manifest};
pub use orchestrator::{merge_outcomes, resolve_audio_path, BatchOrchestrator, BatchReport};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// What to write for a record whose transcription failed in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Every cell is replaced; failures become empty strings
    #[default]
    Overwrite,

    /// A failure keeps the cell's previous non-empty value
    PreserveOnFailure,
}

impl std::str::FromStr for MergePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "overwrite" => Ok(MergePolicy::Overwrite),
            "preserve_on_failure" => Ok(MergePolicy::PreserveOnFailure),
            other => Err(anyhow::anyhow!("Unknown merge policy: {}", other)),
        }
    }
}

/// Why a single record produced no transcript.
#[derive(Debug)]
pub enum BatchItemError {
    /// The audio file could not be read
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The service answered with a non-200 status
    Rejected { status: u16, message: String },

    /// Connection, timeout or other transport failure
    Transport(String),

    /// A 200 whose body was not the expected JSON
    InvalidResponse(String),
}

impl fmt::Display for BatchItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchItemError::Io { path, source } => {
                write!(f, "Cannot read {}: {}", path.display(), source)
            }
            BatchItemError::Rejected { status, message } => {
                write!(f, "Service returned {}: {}", status, message)
            }
            BatchItemError::Transport(msg) => write!(f, "Request failed: {}", msg),
            BatchItemError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
        }
    }
}

impl std::error::Error for BatchItemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BatchItemError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Failures that abort the whole run.
#[derive(Debug)]
pub enum BatchError {
    /// Missing, unreadable or malformed manifest
    ManifestRead { path: PathBuf, message: String },

    MissingColumn(String),

    /// A replacement column does not have one value per record
    LengthMismatch { expected: usize, actual: usize },

    /// The rewritten manifest could not be written or moved into place
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The HTTP client could not be constructed
    Client(String),
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchError::ManifestRead { path, message } => {
                write!(f, "Failed to read manifest {}: {}", path.display(), message)
            }
            BatchError::MissingColumn(name) => write!(f, "Manifest has no '{}' column", name),
            BatchError::LengthMismatch { expected, actual } => write!(
                f,
                "Column length mismatch: expected {} values, got {}",
                expected, actual
            ),
            BatchError::Persist { path, source } => {
                write!(f, "Failed to write manifest {}: {}", path.display(), source)
            }
            BatchError::Client(msg) => write!(f, "Failed to build HTTP client: {}", msg),
        }
    }
}

impl std::error::Error for BatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BatchError::Persist { source, .. } => Some(source),
            _ => None,
        }
    }
}
