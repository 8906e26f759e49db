//! # Audio Normalization
//!
//! Turns an uploaded compressed clip into the shape the acoustic model
//! expects: a flat sequence of `f32` samples, one channel, 16 kHz.
//!
//! ## Pipeline:
//! 1. **Decode** with symphonia into planar PCM at the native rate
//! 2. **Measure** the clip duration from the decoded frame count
//! 3. **Resample** every channel to 16 kHz with rubato (if needed)
//! 4. **Collapse** the channels to mono by averaging each sample index
//!
//! The duration is always taken in step 2 so that it reflects the source
//! clip, not the processed waveform.

use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use super::DecodeError;

/// Sample rate the acoustic model was trained on.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Frames fed to the resampler per call.
const RESAMPLER_CHUNK_FRAMES: usize = 1024;

/// PCM exactly as it came out of the decoder.
///
/// `channels` is planar: one `Vec` per channel, all the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Real elapsed time of the clip in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }
}

/// Model-ready audio: mono, [`TARGET_SAMPLE_RATE`], plus the duration of the
/// source clip.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedWaveform {
    pub samples: Vec<f32>,
    pub duration_secs: f64,
}

impl NormalizedWaveform {
    pub fn sample_rate(&self) -> u32 {
        TARGET_SAMPLE_RATE
    }
}

/// Decode and normalize an in-memory compressed payload.
pub fn normalize(bytes: &[u8]) -> Result<NormalizedWaveform, DecodeError> {
    let source = Box::new(Cursor::new(bytes.to_vec()));
    let decoded = decode(source, None)?;
    normalize_decoded(decoded)
}

/// Decode and normalize a file on disk. The file extension is passed to the
/// probe as a hint; the container is still sniffed from its contents.
pub fn normalize_file(path: &Path) -> Result<NormalizedWaveform, DecodeError> {
    let file = File::open(path)?;
    let extension = path.extension().and_then(|ext| ext.to_str());
    let decoded = decode(Box::new(file), extension)?;
    normalize_decoded(decoded)
}

/// Resample and downmix already-decoded PCM.
///
/// This is the pure part of the pipeline: no I/O, and the same input always
/// produces the same output.
pub fn normalize_decoded(audio: DecodedAudio) -> Result<NormalizedWaveform, DecodeError> {
    if audio.channels.is_empty() || audio.frames() == 0 {
        return Err(DecodeError::Empty);
    }
    if audio.sample_rate == 0 {
        return Err(DecodeError::UnknownSampleRate);
    }

    // Measured before anything below changes the frame count.
    let duration_secs = audio.duration_secs();

    let channels = if audio.sample_rate != TARGET_SAMPLE_RATE {
        debug!(
            "Resampling {} channel(s) from {}Hz to {}Hz",
            audio.channels.len(),
            audio.sample_rate,
            TARGET_SAMPLE_RATE
        );
        resample(&audio.channels, audio.sample_rate, TARGET_SAMPLE_RATE)?
    } else {
        audio.channels
    };

    Ok(NormalizedWaveform {
        samples: collapse_to_mono(channels),
        duration_secs,
    })
}

/// Decode every packet of the first audio track into planar `f32` PCM.
pub fn decode(
    source: Box<dyn MediaSource>,
    extension: Option<&str>,
) -> Result<DecodedAudio, DecodeError> {
    let mss = MediaSourceStream::new(source, Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        let _ = hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| DecodeError::Probe(e.to_string()))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoAudioTrack)?;

    let codec_params = track.codec_params.clone();
    let track_id = track.id;
    let mut sample_rate = codec_params.sample_rate;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError::Codec(format!("codec init failed: {e}")))?;

    let mut channels: Vec<Vec<f32>> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(DecodeError::Codec(format!("packet read: {e}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // A damaged frame is skipped, the rest of the stream is still usable
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Skipping undecodable audio frame: {}", e);
                continue;
            }
            Err(e) => return Err(DecodeError::Codec(format!("decode: {e}"))),
        };

        let spec = *decoded.spec();
        let channel_count = spec.channels.count();
        if channel_count == 0 {
            continue;
        }
        if channels.is_empty() {
            channels = vec![Vec::new(); channel_count];
        } else if channels.len() != channel_count {
            return Err(DecodeError::Codec(format!(
                "channel count changed mid-stream: {} -> {}",
                channels.len(),
                channel_count
            )));
        }
        sample_rate.get_or_insert(spec.rate);

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);

        for frame in buffer.samples().chunks_exact(channel_count) {
            for (plane, &sample) in channels.iter_mut().zip(frame) {
                plane.push(sample);
            }
        }
    }

    if channels.first().map_or(true, Vec::is_empty) {
        return Err(DecodeError::Empty);
    }

    Ok(DecodedAudio {
        channels,
        sample_rate: sample_rate.ok_or(DecodeError::UnknownSampleRate)?,
    })
}

/// Average all channels at each sample index. A single channel is returned
/// untouched.
pub fn collapse_to_mono(mut channels: Vec<Vec<f32>>) -> Vec<f32> {
    if channels.len() <= 1 {
        return channels.pop().unwrap_or_default();
    }

    let count = channels.len() as f32;
    let frames = channels.iter().map(Vec::len).min().unwrap_or(0);

    (0..frames)
        .map(|i| channels.iter().map(|plane| plane[i]).sum::<f32>() / count)
        .collect()
}

/// Resample every channel with a windowed-sinc interpolator.
///
/// The output of each channel is exactly `ceil(frames * to / from)` frames
/// long and aligned with the input: the resampler's output delay is dropped
/// from the front. Channels are processed together, so their order is
/// preserved.
fn resample(
    channels: &[Vec<f32>],
    from_rate: u32,
    to_rate: u32,
) -> Result<Vec<Vec<f32>>, DecodeError> {
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let frames = channels.first().map_or(0, Vec::len);
    let expected = expected_frames(frames, from_rate, to_rate);

    let mut resampler =
        SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLER_CHUNK_FRAMES, channels.len())
            .map_err(|e| DecodeError::Resample(format!("init: {e}")))?;

    let delay = resampler.output_delay();
    let wanted = expected + delay;

    let mut output: Vec<Vec<f32>> =
        vec![Vec::with_capacity(wanted + RESAMPLER_CHUNK_FRAMES); channels.len()];

    let mut start = 0;
    while start < frames || output[0].len() < wanted {
        let end = (start + RESAMPLER_CHUNK_FRAMES).min(frames);

        // The last chunk, and any flush chunks after it, are padded with silence
        let input: Vec<Vec<f32>> = channels
            .iter()
            .map(|plane| {
                let mut chunk = plane.get(start..end).unwrap_or_default().to_vec();
                chunk.resize(RESAMPLER_CHUNK_FRAMES, 0.0);
                chunk
            })
            .collect();

        let resampled = resampler
            .process(&input, None)
            .map_err(|e| DecodeError::Resample(format!("process: {e}")))?;

        for (plane, chunk) in output.iter_mut().zip(resampled) {
            plane.extend_from_slice(&chunk);
        }

        start = end;
    }

    for plane in &mut output {
        plane.drain(..delay);
        plane.truncate(expected);
    }

    Ok(output)
}

fn expected_frames(frames: usize, from_rate: u32, to_rate: u32) -> usize {
    let numerator = frames as u64 * u64::from(to_rate);
    numerator.div_ceil(u64::from(from_rate)) as usize
}
