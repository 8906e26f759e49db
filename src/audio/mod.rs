//! # Audio Processing Module
//!
//! Decoding and normalization of uploaded clips into model-ready waveforms.
//!
//! ## Output Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: 32-bit float samples, nominally in [-1.0, 1.0]

pub mod normalizer;

pub use normalizer::{
    normalize, normalize_decoded, normalize_file, DecodedAudio, NormalizedWaveform,
    TARGET_SAMPLE_RATE,
};

use std::fmt;

/// Failure to turn an upload into PCM samples.
#[derive(Debug)]
pub enum DecodeError {
    /// The payload could not be read
    Io(std::io::Error),

    /// No container format recognised the payload
    Probe(String),

    /// The container holds no decodable audio track
    NoAudioTrack,

    /// The codec rejected the stream
    Codec(String),

    /// Decoding succeeded but produced no samples
    Empty,

    /// Neither the container nor the decoded frames declared a sample rate
    UnknownSampleRate,

    /// The resampler could not be built or failed mid-stream
    Resample(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Io(err) => write!(f, "Failed to read audio: {}", err),
            DecodeError::Probe(msg) => write!(f, "Unrecognised audio format: {}", msg),
            DecodeError::NoAudioTrack => write!(f, "No audio track found"),
            DecodeError::Codec(msg) => write!(f, "Audio decoding failed: {}", msg),
            DecodeError::Empty => write!(f, "No audio samples decoded"),
            DecodeError::UnknownSampleRate => write!(f, "Audio sample rate is unknown"),
            DecodeError::Resample(msg) => write!(f, "Resampling failed: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(err: std::io::Error) -> Self {
        DecodeError::Io(err)
    }
}

/// Audio clips for tests anywhere in the crate.
#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::Cursor;

    /// 25 MPEG-1 Layer III frames of silence: 48kHz mono, 32kbps, 0.6s.
    pub(crate) const SILENT_MP3: &[u8] = include_bytes!("testdata/silence-48k-mono.mp3");

    pub(crate) const SILENT_MP3_FRAMES: usize = 25 * 1152;

    /// Encode planar 16-bit channels as a PCM WAV file.
    pub(crate) fn wav_bytes(sample_rate: u32, channels: &[Vec<i16>]) -> Vec<u8> {
        let frames = channels.first().map_or(0, Vec::len);
        let mut interleaved = Vec::with_capacity(frames * channels.len());
        for i in 0..frames {
            for plane in channels {
                interleaved.push(plane[i]);
            }
        }

        let header = wav::Header::new(
            wav::header::WAV_FORMAT_PCM,
            channels.len() as u16,
            sample_rate,
            16,
        );
        let mut cursor = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(interleaved), &mut cursor)
            .expect("in-memory wav write");
        cursor.into_inner()
    }

    /// A short mono tone at 16kHz.
    pub(crate) fn tone_wav(frames: usize) -> Vec<u8> {
        let samples = (0..frames)
            .map(|i| ((i as f32 * 0.05).sin() * 10_000.0) as i16)
            .collect();
        wav_bytes(16_000, &[samples])
    }
}
