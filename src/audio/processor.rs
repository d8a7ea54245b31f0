//! # Audio Decoding
//!
//! Turns the compressed bytes a client uploads or streams into the 16kHz mono
//! float samples Whisper consumes.
//!
//! ## Decoding paths:
//! - **WAV**: parsed in-process with the `wav` crate, then downmixed and resampled
//! - **Everything else** (webm/opus, mp3, m4a, ogg, ...): written to a temporary
//!   file and piped through `ffmpeg`, which emits signed 16-bit little-endian PCM
//!
//! Decoding is blocking work. Callers run it on the blocking thread pool,
//! never on an async worker.

use anyhow::{anyhow, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Write};
use std::process::{Command, Stdio};

/// Sample rate every speech model in this service expects.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Decodes container audio into model-ready PCM.
#[derive(Debug, Clone)]
pub struct AudioDecoder {
    ffmpeg_path: String,
}

impl AudioDecoder {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Decode arbitrary container bytes into 16kHz mono samples in [-1.0, 1.0].
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        if bytes.is_empty() {
            return Err(anyhow!("Audio data is empty"));
        }

        let samples = if is_wav(bytes) {
            decode_wav(bytes)?
        } else {
            self.decode_with_ffmpeg(bytes)?
        };

        if samples.is_empty() {
            return Err(anyhow!("Audio decoded to zero samples"));
        }

        tracing::debug!(
            "Decoded {} bytes into {:.2}s of audio",
            bytes.len(),
            samples.len() as f64 / TARGET_SAMPLE_RATE as f64
        );
        Ok(samples)
    }

    /// Run ffmpeg over a temporary copy of the payload.
    ///
    /// ffmpeg needs a seekable input for several containers (mp4/m4a in
    /// particular), so the bytes go through a temp file instead of stdin.
    fn decode_with_ffmpeg(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let mut input = tempfile::Builder::new()
            .prefix("verbalaize-")
            .suffix(".webm")
            .tempfile()
            .context("Failed to create temporary audio file")?;
        input
            .write_all(bytes)
            .context("Failed to write temporary audio file")?;
        input.flush()?;

        let output = Command::new(&self.ffmpeg_path)
            .args(["-nostdin", "-hide_banner", "-loglevel", "error", "-i"])
            .arg(input.path())
            .args(["-f", "s16le", "-ac", "1", "-ar"])
            .arg(TARGET_SAMPLE_RATE.to_string())
            .arg("-")
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run '{}'", self.ffmpeg_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "ffmpeg could not decode audio ({}): {}",
                output.status,
                stderr.trim()
            ));
        }

        Ok(pcm_s16le_to_f32(&output.stdout))
    }
}

/// Check for a RIFF/WAVE header.
pub fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

fn decode_wav(bytes: &[u8]) -> Result<Vec<f32>> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) = wav::read(&mut cursor).context("Invalid WAV data")?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples
            .into_iter()
            .map(|s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(samples) => samples.into_iter().map(|s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(samples) => samples
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };

    let mono = downmix(&interleaved, header.channel_count as usize);
    Ok(resample_linear(&mono, header.sampling_rate, TARGET_SAMPLE_RATE))
}

/// Convert signed 16-bit little-endian PCM to floats. A trailing odd byte is ignored.
pub fn pcm_s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }
    samples
}

/// Average interleaved channels into one.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resampler. Adequate for speech; not for music.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(last)];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}
