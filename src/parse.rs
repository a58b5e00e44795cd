//! Binary decoders for melomind notification payloads.
//!
//! All public functions in this module are pure (no I/O, no state) and are
//! safe to call from any async or sync context.
//!
//! | Function | Source | Format |
//! |---|---|---|
//! | [`decode_sample`] | telemetry | 2 bytes → 20-bit signed word, 0.286 µV / 8 per LSB |
//! | [`decode_eeg_block`] | telemetry | full packet → per-channel volts, lost bytes → `NaN` |
//! | [`split_telemetry`] | telemetry | `[index_hi, index_lo, payload…]` |
//! | [`decode_battery`] | device state / mailbox | profile-specific byte → percent table |
//! | [`decode_headset_status`] | headset status | `[1, saturation]` |
//! | [`decode_ims_frame`] | mailbox `0x50` | 3 × i16 LE per sample |

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::DecodeError;
use crate::protocol::{HardwareProfile, BYTES_PER_SAMPLE};
use crate::types::XyzSample;

// ── EEG ──────────────────────────────────────────────────────────────────────

/// Bit position of the first data byte inside the 32-bit word
/// (8 bits of byte alignment + 4 configuration bits).
const SAMPLE_SHIFT: u32 = 12;
const SIGN_BIT: u32 = 0x80 << SAMPLE_SHIFT;
const NEGATIVE_MASK: u32 = 0xFFF0_0000;
const POSITIVE_MASK: u32 = !NEGATIVE_MASK;

/// ADS1299 volts per LSB after the amplifier gain is removed.
pub const VOLTS_PER_LSB: f32 = 0.286e-6 / 8.0;

/// Assemble two raw bytes into a sign-extended 32-bit word.
///
/// ```text
/// word = (b0 << 12) | (b1 << 4)
/// bit 19 set   → word | 0xFFF00000
/// bit 19 clear → word & 0x000FFFFF
/// ```
pub fn sample_word(b0: u8, b1: u8) -> i32 {
    let word = ((b0 as u32) << SAMPLE_SHIFT) | ((b1 as u32) << (SAMPLE_SHIFT - 8));
    let extended = if word & SIGN_BIT != 0 {
        word | NEGATIVE_MASK
    } else {
        word & POSITIVE_MASK
    };
    extended as i32
}

/// Decode one raw sample to volts.
pub fn decode_sample(b0: u8, b1: u8) -> f32 {
    sample_word(b0, b1) as f32 * VOLTS_PER_LSB
}

/// Decode a byte run into samples, in wire order. A trailing odd byte is
/// ignored.
pub fn decode_samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|c| decode_sample(c[0], c[1]))
        .collect()
}

/// Distribute interleaved samples over `channel_count` channels:
/// sample `i` goes to channel `i % channel_count`.
pub fn spread(samples: &[f32], channel_count: usize) -> Vec<Vec<f32>> {
    let channel_count = channel_count.max(1);
    let mut channels = vec![Vec::with_capacity(samples.len() / channel_count + 1); channel_count];
    for (i, &value) in samples.iter().enumerate() {
        channels[i % channel_count].push(value);
    }
    channels
}

/// Decode a complete EEG packet into per-channel volts.
///
/// `lost` flags bytes that were synthesised for missing notifications; a
/// sample touching any lost byte decodes to `NaN`. `lost` may be shorter than
/// `bytes` (missing entries count as received).
pub fn decode_eeg_block(bytes: &[u8], lost: &[bool], channel_count: usize) -> Vec<Vec<f32>> {
    let is_lost = |i: usize| lost.get(i).copied().unwrap_or(false);
    let samples: Vec<f32> = bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .enumerate()
        .map(|(n, c)| {
            let first = n * BYTES_PER_SAMPLE;
            if is_lost(first) || is_lost(first + 1) {
                f32::NAN
            } else {
                decode_sample(c[0], c[1])
            }
        })
        .collect();
    spread(&samples, channel_count)
}

/// Split a telemetry notification into its big-endian sequence index and
/// sample payload.
pub fn split_telemetry(data: &[u8]) -> Result<(u16, &[u8]), DecodeError> {
    if data.len() < 2 {
        return Err(DecodeError::Truncated {
            got: data.len(),
            need: 2,
        });
    }
    Ok((u16::from_be_bytes([data[0], data[1]]), &data[2..]))
}

// ── Battery ──────────────────────────────────────────────────────────────────

const INDUS2_BATTERY: [f32; 7] = [0.0, 15.0, 30.0, 50.0, 65.0, 85.0, 100.0];
const INDUS5_BATTERY: [f32; 13] = [
    0.0, 0.0, 0.0, 0.0, 0.0, 12.5, 25.0, 37.5, 50.0, 62.5, 75.0, 87.5, 100.0,
];

/// Convert the raw battery byte to a percentage using the profile's table.
pub fn decode_battery(profile: HardwareProfile, raw: u8) -> Result<f32, DecodeError> {
    let table: &[f32] = match profile {
        HardwareProfile::Indus2 | HardwareProfile::Indus3 => &INDUS2_BATTERY,
        HardwareProfile::Indus5 => &INDUS5_BATTERY,
    };
    table
        .get(raw as usize)
        .copied()
        .ok_or(DecodeError::BatteryOutOfRange(raw))
}

// ── Headset status ───────────────────────────────────────────────────────────

/// Parse a headset status notification.
///
/// Returns the saturation code (0 none, 1 left, 2 right, 3 both) for a
/// `[1, status]` frame and `None` for any other status type.
pub fn decode_headset_status(data: &[u8]) -> Result<Option<u8>, DecodeError> {
    match data {
        [] | [_] => Err(DecodeError::Truncated {
            got: data.len(),
            need: 2,
        }),
        [1, status, ..] => Ok(Some(*status)),
        _ => Ok(None),
    }
}

// ── Accelerometer ────────────────────────────────────────────────────────────

/// Bytes per accelerometer sample: x, y, z as little-endian `i16`.
pub const IMS_SAMPLE_BYTES: usize = 6;

fn read_i16_le(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Decode an IMS data frame payload. Each axis is multiplied by `scale`;
/// a trailing partial sample is ignored.
pub fn decode_ims_frame(data: &[u8], scale: f32) -> Vec<XyzSample> {
    data.chunks_exact(IMS_SAMPLE_BYTES)
        .map(|c| XyzSample {
            x: scale * read_i16_le(c, 0) as f32,
            y: scale * read_i16_le(c, 2) as f32,
            z: scale * read_i16_le(c, 4) as f32,
        })
        .collect()
}

// ── Time ─────────────────────────────────────────────────────────────────────

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_sample_keeps_magnitude() {
        assert_eq!(sample_word(0x00, 0x01), 0x10);
        assert_eq!(sample_word(0x7F, 0xFF), 0x7FFF0);
    }

    #[test]
    fn negative_sample_is_twos_complement() {
        // 0xFFFF → 0xFFFFFFF0 = -16
        assert_eq!(sample_word(0xFF, 0xFF), -16);
        // 0x8000 → 0xFFF80000 = -(1 << 19)
        assert_eq!(sample_word(0x80, 0x00), -(1 << 19));
        assert!(decode_sample(0x80, 0x00) < 0.0);
    }

    #[test]
    fn volts_scale() {
        let v = decode_sample(0x00, 0x01);
        assert!((v - 16.0 * VOLTS_PER_LSB).abs() < f32::EPSILON);
    }

    #[test]
    fn spread_interleaves_channels() {
        let channels = spread(&[1.0, 2.0, 3.0, 4.0, 5.0], 2);
        assert_eq!(channels, vec![vec![1.0, 3.0, 5.0], vec![2.0, 4.0]]);
    }

    #[test]
    fn lost_bytes_decode_to_nan() {
        let bytes = [0x00, 0x01, 0xFF, 0xFF, 0x00, 0x02, 0x00, 0x03];
        let lost = [false, false, true, true];
        let channels = decode_eeg_block(&bytes, &lost, 2);
        assert!(!channels[0][0].is_nan());
        assert!(channels[1][0].is_nan());
        assert!(!channels[0][1].is_nan());
        assert!(!channels[1][1].is_nan());
    }

    #[test]
    fn decoding_is_idempotent() {
        let bytes: Vec<u8> = (0..40u8).collect();
        assert_eq!(decode_eeg_block(&bytes, &[], 2), decode_eeg_block(&bytes, &[], 2));
    }

    #[test]
    fn telemetry_index_is_big_endian() {
        let (index, payload) = split_telemetry(&[0x01, 0x02, 0xAA]).unwrap();
        assert_eq!(index, 0x0102);
        assert_eq!(payload, &[0xAA]);
        assert!(split_telemetry(&[0x01]).is_err());
    }

    #[test]
    fn battery_tables() {
        assert_eq!(decode_battery(HardwareProfile::Indus2, 3), Ok(50.0));
        assert_eq!(decode_battery(HardwareProfile::Indus3, 6), Ok(100.0));
        assert_eq!(decode_battery(HardwareProfile::Indus5, 4), Ok(0.0));
        assert_eq!(decode_battery(HardwareProfile::Indus5, 5), Ok(12.5));
        assert_eq!(decode_battery(HardwareProfile::Indus5, 12), Ok(100.0));
        assert_eq!(
            decode_battery(HardwareProfile::Indus2, 7),
            Err(DecodeError::BatteryOutOfRange(7))
        );
        assert!(decode_battery(HardwareProfile::Indus5, 13).is_err());
    }

    #[test]
    fn headset_status() {
        assert_eq!(decode_headset_status(&[1, 3]), Ok(Some(3)));
        assert_eq!(decode_headset_status(&[2, 3]), Ok(None));
        assert!(decode_headset_status(&[1]).is_err());
    }

    #[test]
    fn ims_frame_is_little_endian() {
        let frame = [0x01, 0x00, 0xFF, 0xFF, 0x00, 0x01, 0x02];
        let samples = decode_ims_frame(&frame, 2.0);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0], XyzSample { x: 2.0, y: -2.0, z: 512.0 });
    }
}
