//! # Audio Analysis
//!
//! Stateless signal analysis for inbound microphone frames: volume (RMS),
//! silence classification and frame concatenation.
//!
//! ## Audio Format:
//! - 16-bit signed PCM, little-endian, mono, 16 kHz nominal
//!
//! Nothing in here fails. Malformed input degrades to a default or heuristic
//! result so the realtime loop never has to handle an audio error.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Bytes inspected by the non-PCM fallback heuristic.
const HEURISTIC_SAMPLE_BYTES: usize = 100;

/// Non-zero bytes (out of the inspected prefix) needed to call a payload audible.
const HEURISTIC_NON_ZERO_MIN: usize = 10;

/// Volume reported when the heuristic decides a payload is audible.
const HEURISTIC_VOLUME: f32 = 0.1;

/// Result of classifying one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameAnalysis {
    pub silent: bool,
    /// Normalized RMS in [0, 1]
    pub volume: f32,
}

/// Root-mean-square of the normalized samples (`sample / 32768`).
///
/// Returns `0.0` for empty buffers and buffers with an odd byte count.
pub fn compute_volume(buffer: &[u8]) -> f32 {
    pcm_rms(buffer).unwrap_or(0.0)
}

/// Classify a frame as silent or audible against `threshold`.
///
/// When the payload can't be read as 16-bit PCM, falls back to counting
/// non-zero bytes in the first 100 bytes: more than 10 means audible with an
/// approximate volume of `0.1`.
pub fn classify(buffer: &[u8], threshold: f32) -> FrameAnalysis {
    if !is_pcm_shaped(buffer) {
        return heuristic_analysis(buffer);
    }
    let volume = compute_volume(buffer);
    FrameAnalysis {
        silent: volume < threshold,
        volume,
    }
}

/// Byte-level concatenation in input order.
pub fn concat<B: AsRef<[u8]>>(buffers: &[B]) -> Vec<u8> {
    let total = buffers.iter().map(|b| b.as_ref().len()).sum();
    let mut joined = Vec::with_capacity(total);
    for buffer in buffers {
        joined.extend_from_slice(buffer.as_ref());
    }
    joined
}

fn is_pcm_shaped(buffer: &[u8]) -> bool {
    !buffer.is_empty() && buffer.len() % 2 == 0
}

/// RMS over little-endian i16 samples, `None` when the payload isn't PCM-shaped.
fn pcm_rms(buffer: &[u8]) -> Option<f32> {
    if !is_pcm_shaped(buffer) {
        return None;
    }

    let mut cursor = Cursor::new(buffer);
    let mut sum_squares = 0.0f64;
    let mut sample_count = 0usize;

    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        let normalized = sample as f64 / 32768.0;
        sum_squares += normalized * normalized;
        sample_count += 1;
    }

    if sample_count == 0 {
        return None;
    }

    let rms = (sum_squares / sample_count as f64).sqrt() as f32;
    if rms.is_finite() {
        Some(rms.clamp(0.0, 1.0))
    } else {
        None
    }
}

fn heuristic_analysis(buffer: &[u8]) -> FrameAnalysis {
    let non_zero = buffer
        .iter()
        .take(HEURISTIC_SAMPLE_BYTES)
        .filter(|&&b| b != 0)
        .count();

    if non_zero > HEURISTIC_NON_ZERO_MIN {
        FrameAnalysis {
            silent: false,
            volume: HEURISTIC_VOLUME,
        }
    } else {
        FrameAnalysis {
            silent: true,
            volume: 0.0,
        }
    }
}
