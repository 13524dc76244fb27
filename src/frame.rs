//! PCM framing between float audio and the wire format
//!
//! Outbound: float microphone frames become 16-bit little-endian PCM.
//! Inbound: base-64 PCM chunks from the model become float samples.

use base64::engine::general_purpose;
use base64::Engine;

/// A block of mono float samples at the capture rate.
#[derive(Debug, Clone, Default)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    /// Root-mean-square loudness of the frame.
    pub fn loudness(&self) -> f32 {
        rms(&self.samples)
    }
}

/// Little-endian 16-bit PCM bytes ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk(pub Vec<u8>);

impl EncodedChunk {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Model audio decoded to float samples.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn loudness(&self) -> f32 {
        rms(&self.samples)
    }
}

/// Failure to turn an inbound audio chunk into samples.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DecodeError {
    #[error("invalid base64 audio payload: {0}")]
    Base64(String),

    #[error("PCM payload has odd length {0}")]
    OddLength(usize),
}

/// Encode one frame for the wire and measure its loudness.
pub fn encode(frame: &AudioFrame) -> (EncodedChunk, f32) {
    let mut bytes = Vec::with_capacity(frame.samples.len() * 2);
    for &s in &frame.samples {
        let value = (sanitize(s) * 32767.0).round() as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    (EncodedChunk(bytes), frame.loudness())
}

/// Clamp to [-1, 1]; NaN counts as silence.
fn sanitize(s: f32) -> f32 {
    if s.is_nan() {
        0.0
    } else {
        s.clamp(-1.0, 1.0)
    }
}

/// Root-mean-square of the samples, clamped to [0, 1].
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let s = sanitize(s) as f64;
            s * s
        })
        .sum();
    ((sum / samples.len() as f64).sqrt() as f32).clamp(0.0, 1.0)
}

/// Decode a base-64 PCM chunk as delivered by the service. `default_rate`
/// applies when the mime type names no rate.
pub fn decode_chunk(
    data: &str,
    mime_type: Option<&str>,
    default_rate: u32,
) -> Result<DecodedAudio, DecodeError> {
    let bytes = general_purpose::STANDARD
        .decode(data)
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    let samples = decode_pcm16(&bytes)?;
    Ok(DecodedAudio {
        samples,
        sample_rate: mime_type.and_then(rate_from_mime).unwrap_or(default_rate),
    })
}

/// Convert little-endian 16-bit PCM to float samples in [-1, 1).
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

/// Pull the `rate=` parameter out of a mime type like `audio/pcm;rate=24000`.
fn rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
        .filter(|&rate| rate > 0)
}
