//! # Audio Validation and Normalization
//!
//! Handles validation and normalization of untrusted client audio before it
//! reaches the inference pipeline, plus the byte-level PCM conversions used by
//! the WebSocket transport.
//!
//! ## Key Functions:
//! - **Amplitude guarding**: Reject NaN/Inf blocks, rescale suspected int16
//!   data, clip everything into [-1.0, 1.0]
//! - **Format conversion**: Raw little-endian float32 bytes <-> sample vectors
//! - **Fail-safe behavior**: Corrupt audio becomes silence, never an error
//!   that could tear down a live connection

use crate::error::AppError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Amplitude above which a float32 block is assumed to be 16-bit integer PCM
/// that the client serialized without rescaling. Well-formed float audio sits
/// in [-1, 1]; genuine int16 samples reach the tens of thousands.
const INT16_SUSPECT_THRESHOLD: f32 = 5.0;

/// Rescale divisor applied when the int16 heuristic triggers.
const INT16_SCALE: f32 = 32768.0;

/// Validate and normalize a decoded sample block.
///
/// ## Behavior:
/// 1. Any NaN or infinite sample poisons the whole block: the result is a
///    zero-filled block of the same length (silence), keeping corrupt data out
///    of the model while preserving stream timing.
/// 2. If the peak absolute value exceeds 5.0 the block is treated as int16
///    data misread as float32 and every sample is divided by 32768.0.
/// 3. Every sample is clipped to the closed range [-1.0, 1.0].
///
/// Pure and deterministic; empty input yields empty output.
pub fn validate_and_normalize(samples: &[f32]) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }

    if samples.iter().any(|s| !s.is_finite()) {
        return vec![0.0; samples.len()];
    }

    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    let scale = if peak > INT16_SUSPECT_THRESHOLD {
        1.0 / INT16_SCALE
    } else {
        1.0
    };

    samples
        .iter()
        .map(|s| (s * scale).clamp(-1.0, 1.0))
        .collect()
}

/// Decode raw little-endian float32 bytes into samples.
///
/// The transport frame boundary is the only framing, so the byte length is
/// authoritative: anything that is not a multiple of 4 is malformed.
pub fn samples_from_bytes(data: &[u8]) -> Result<Vec<f32>, AppError> {
    if data.len() % 4 != 0 {
        return Err(AppError::AudioFormat(format!(
            "audio payload of {} bytes is not a multiple of 4",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 4);
    while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
        samples.push(sample);
    }

    Ok(samples)
}

/// Encode samples back into the little-endian float32 wire format.
pub fn samples_to_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 4);
    for &sample in samples {
        // Writing into a Vec cannot fail
        out.write_f32::<LittleEndian>(sample).expect("vec write");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_yields_empty_output() {
        assert!(validate_and_normalize(&[]).is_empty());
    }

    #[test]
    fn test_nan_poisons_whole_block() {
        let block = vec![0.5, f32::NAN, -0.25, 0.75];
        let out = validate_and_normalize(&block);
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn test_infinity_poisons_whole_block() {
        let block = vec![0.1, f32::INFINITY, 0.2];
        assert_eq!(validate_and_normalize(&block), vec![0.0; 3]);

        let block = vec![f32::NEG_INFINITY, 0.0];
        assert_eq!(validate_and_normalize(&block), vec![0.0; 2]);
    }

    #[test]
    fn test_int16_heuristic_rescales() {
        // Simulates int16 data (peak 20000) serialized as float32
        let block = vec![20000.0, -15000.0, 512.0, -32768.0];
        let out = validate_and_normalize(&block);

        let peak = out.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!(peak <= 1.0, "rescaled peak {} should be <= 1.0", peak);
        assert!((out[0] - 20000.0 / 32768.0).abs() < 1e-6);
    }

    #[test]
    fn test_loud_float_audio_is_clipped_not_rescaled() {
        // Peak 4.0 stays below the int16 threshold, so samples are only clipped
        let block = vec![4.0, -3.0, 0.5];
        let out = validate_and_normalize(&block);
        assert_eq!(out, vec![1.0, -1.0, 0.5]);
    }

    #[test]
    fn test_idempotent_on_well_formed_audio() {
        let block = vec![0.0, 0.25, -0.5, 1.0, -1.0, 0.999];
        let once = validate_and_normalize(&block);
        let twice = validate_and_normalize(&once);
        assert_eq!(once, twice);
        assert_eq!(once, block);
    }

    #[test]
    fn test_byte_round_trip() {
        let samples = vec![0.0f32, 0.5, -0.5, 1.0, -1.0];
        let bytes = samples_to_bytes(&samples);
        assert_eq!(bytes.len(), samples.len() * 4);

        let decoded = samples_from_bytes(&bytes).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_misaligned_bytes_rejected() {
        let bytes = vec![0u8; 7];
        assert!(samples_from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_empty_bytes_decode_to_empty_block() {
        assert!(samples_from_bytes(&[]).unwrap().is_empty());
    }
}
