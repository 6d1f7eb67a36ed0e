//! PCM16 codec.
//!
//! Conversions between in-process float samples (`-1.0..=1.0`) and the
//! signed 16-bit little-endian PCM used on the wire, plus the base64 text
//! form embedded in JSON envelopes.
//!
//! # Quantization
//!
//! Negative samples scale by `0x8000`, non-negative samples by `0x7FFF`, and
//! decoding divides by `32768.0`. A round trip is lossy: the error per sample
//! is at most `(|x| + 0.5) / 32768`.

use base64::prelude::*;
use bytes::Bytes;

/// Scale applied to negative samples when encoding.
const NEGATIVE_SCALE: f32 = 0x8000 as f32;

/// Scale applied to non-negative samples when encoding.
const POSITIVE_SCALE: f32 = 0x7FFF as f32;

/// Normalization factor used when decoding PCM16 back to float.
pub const PCM_TO_FLOAT_SCALE: f32 = 1.0 / 32768.0;

/// Size of one PCM16 sample in bytes.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Convert one float sample to a PCM16 value.
#[inline]
pub fn sample_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    let scaled = if clamped < 0.0 {
        clamped * NEGATIVE_SCALE
    } else {
        clamped * POSITIVE_SCALE
    };
    // `as` saturates, and maps NaN to 0
    scaled.round() as i16
}

/// Convert one PCM16 value to a float sample.
#[inline]
pub fn i16_to_sample(value: i16) -> f32 {
    value as f32 * PCM_TO_FLOAT_SCALE
}

/// Encode float samples to PCM16 little-endian bytes.
///
/// Empty input yields empty output.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        out.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    out
}

/// Encode float samples straight to the base64 text used in JSON envelopes.
pub fn encode_base64(samples: &[f32]) -> String {
    BASE64_STANDARD.encode(encode(samples))
}

/// Decode PCM16 little-endian bytes to float samples.
///
/// A trailing odd byte cannot form a sample and is ignored.
pub fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16_to_sample(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

/// Decode a base64 PCM16 payload to float samples.
pub fn decode_base64(text: &str) -> Result<Vec<f32>, base64::DecodeError> {
    Ok(decode(&BASE64_STANDARD.decode(text)?))
}

/// Root-mean-square amplitude of a block. Zero for an empty block.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Convert interleaved multi-channel samples to mono by averaging frames.
pub fn downmix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let channels = channels as usize;
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// A PCM16 buffer produced from exactly one audio block.
///
/// Consumed once: either sent by the connection manager or enqueued for
/// playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// PCM16 little-endian bytes
    pub data: Bytes,
    /// Sample rate of the source block in Hz
    pub sample_rate: u32,
}

impl EncodedChunk {
    /// Encode a block of float samples.
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            data: Bytes::from(encode(samples)),
            sample_rate,
        }
    }

    /// Number of samples carried by this chunk.
    pub fn sample_count(&self) -> usize {
        self.data.len() / BYTES_PER_SAMPLE
    }

    /// Playback duration of the chunk in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.sample_count() as u64 * 1000) / self.sample_rate as u64
    }

    /// Base64 text form for JSON transport.
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.data)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: f64 = 1.0 / 32768.0;

    #[test]
    fn test_empty_input() {
        assert!(encode(&[]).is_empty());
        assert!(decode(&[]).is_empty());
        assert_eq!(encode_base64(&[]), "");
        assert!(decode_base64("").unwrap().is_empty());
    }

    #[test]
    fn test_extremes() {
        assert_eq!(encode(&[1.0]), 0x7FFFi16.to_le_bytes().to_vec());
        assert_eq!(encode(&[-1.0]), i16::MIN.to_le_bytes().to_vec());
        assert_eq!(encode(&[0.0]), vec![0, 0]);
    }

    #[test]
    fn test_clamping() {
        assert_eq!(encode(&[1.5]), encode(&[1.0]));
        assert_eq!(encode(&[-1.5]), encode(&[-1.0]));
        assert_eq!(encode(&[f32::INFINITY]), encode(&[1.0]));
    }

    #[test]
    fn test_nan_encodes_as_silence() {
        assert_eq!(encode(&[f32::NAN]), vec![0, 0]);
    }

    #[test]
    fn test_little_endian_layout() {
        // 0.5 * 0x7FFF = 16383.5 -> 16384 = 0x4000
        assert_eq!(encode(&[0.5]), vec![0x00, 0x40]);
        assert_eq!(decode(&[0x00, 0x40]), vec![0.5]);
    }

    #[test]
    fn test_round_trip_within_quantization() {
        let samples: Vec<f32> = (0..=2000).map(|i| -1.0 + i as f32 / 1000.0).collect();
        let decoded = decode(&encode(&samples));
        assert_eq!(decoded.len(), samples.len());

        for (original, restored) in samples.iter().zip(decoded.iter()) {
            let diff = (*original as f64 - *restored as f64).abs();
            let bound = (original.abs() as f64 + 0.5) * STEP + 1e-9;
            assert!(
                diff <= bound,
                "sample {} restored as {} (diff {})",
                original,
                restored,
                diff
            );
        }
    }

    #[test]
    fn test_negative_round_trip_is_half_step() {
        for x in [-1.0f32, -0.75, -0.333, -0.01, -0.0001] {
            let restored = decode(&encode(&[x]))[0];
            assert!((x as f64 - restored as f64).abs() <= 0.5 * STEP + 1e-9);
        }
    }

    #[test]
    fn test_odd_trailing_byte_ignored() {
        let decoded = decode(&[0x00, 0x40, 0x7F]);
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn test_base64_round_trip() {
        let samples = [0.0f32, 0.25, -0.25];
        let text = encode_base64(&samples);
        let restored = decode_base64(&text).unwrap();
        assert_eq!(restored.len(), 3);
        assert!(decode_base64("not base64!!").is_err());
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0.0; 16]), 0.0);
        let value = rms(&[0.5, -0.5, 0.5, -0.5]);
        assert!((value - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_downmix() {
        let stereo = [0.25f32, 0.75, -1.0, 1.0];
        assert_eq!(downmix_to_mono(&stereo, 2), vec![0.5, 0.0]);
        assert_eq!(downmix_to_mono(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }

    #[test]
    fn test_encoded_chunk() {
        let chunk = EncodedChunk::from_samples(&[0.0; 1600], 16000);
        assert_eq!(chunk.sample_count(), 1600);
        assert_eq!(chunk.duration_ms(), 100);
        assert!(!chunk.is_empty());
        assert_eq!(chunk.to_base64().len() % 4, 0);
    }
}
