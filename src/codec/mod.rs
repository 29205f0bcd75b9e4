//! Binäre Report-Codecs
//!
//! Gemeinsame Quantisierung für alle Transporte. Die Layouts selbst liegen in
//! [`bridge`] (serielle und TCP-Mikrocontroller) und [`dualshock`] (HID).

pub mod bridge;
pub mod dualshock;

use glam::Vec3;
use thiserror::Error;

/// Fehler beim Dekodieren eines Rohframes
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame zu kurz: {actual} Bytes, erwartet {expected}")]
    ShortFrame { expected: usize, actual: usize },

    #[error("Unerwartete Report-ID: {0:#04x}")]
    UnexpectedReportId(u8),
}

/// Prüft, ob `buf` mindestens `expected` Bytes lang ist
pub(crate) fn ensure_len(buf: &[u8], expected: usize) -> Result<(), CodecError> {
    if buf.len() < expected {
        Err(CodecError::ShortFrame {
            expected,
            actual: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Symmetrische Normalisierung: `i16::MIN` → -1, `i16::MAX` → +1
pub fn decode_axis(raw: i16) -> f32 {
    let value = f32::from(raw);
    if raw < 0 {
        value / 32768.0
    } else {
        value / 32767.0
    }
}

/// Umkehrung von [`decode_axis`], Eingabe wird auf [-1,1] geklemmt
pub fn encode_axis(value: f32) -> i16 {
    if !value.is_finite() {
        return 0;
    }
    let value = value.clamp(-1.0, 1.0);
    let scaled = if value < 0.0 {
        value * 32768.0
    } else {
        value * 32767.0
    };
    scaled.round() as i16
}

pub fn decode_unit(raw: u8) -> f32 {
    f32::from(raw) / 255.0
}

pub fn encode_unit(value: f32) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Vollausschlag der Sensoren aus dem Info-Report
///
/// Ein Wert von null bedeutet "unbekannt", die Rohwerte werden dann unskaliert
/// durchgereicht.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorScale {
    /// Beschleunigung in g
    pub accel: u16,
    /// Drehrate in Grad/s
    pub gyro: u16,
}

impl SensorScale {
    pub fn new(accel: u16, gyro: u16) -> Self {
        Self { accel, gyro }
    }

    pub fn is_known(&self) -> bool {
        self.accel != 0 && self.gyro != 0
    }

    pub fn accel(&self, raw: [i16; 3]) -> Vec3 {
        scale_vector(raw, if self.is_known() { self.accel } else { 0 })
    }

    pub fn gyro(&self, raw: [i16; 3]) -> Vec3 {
        scale_vector(raw, if self.is_known() { self.gyro } else { 0 })
    }
}

fn scale_vector(raw: [i16; 3], full_scale: u16) -> Vec3 {
    let v = Vec3::new(f32::from(raw[0]), f32::from(raw[1]), f32::from(raw[2]));
    if full_scale == 0 {
        v
    } else {
        v / (32768.0 / f32::from(full_scale))
    }
}

pub(crate) fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

pub(crate) fn read_i16(buf: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([buf[at], buf[at + 1]])
}

pub(crate) fn read_i16x3(buf: &[u8], at: usize) -> [i16; 3] {
    [read_i16(buf, at), read_i16(buf, at + 2), read_i16(buf, at + 4)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn axis_extremes_are_exact() {
        assert_eq!(decode_axis(i16::MIN), -1.0);
        assert_eq!(decode_axis(i16::MAX), 1.0);
        assert_eq!(decode_axis(0), 0.0);
        assert_eq!(encode_axis(-1.0), i16::MIN);
        assert_eq!(encode_axis(1.0), i16::MAX);
    }

    #[test]
    fn half_scale_axis() {
        assert_relative_eq!(decode_axis(16384), 0.5, epsilon = 1e-4);
    }

    #[test]
    fn encode_clamps_out_of_range() {
        assert_eq!(encode_axis(7.0), i16::MAX);
        assert_eq!(encode_axis(f32::NAN), 0);
        assert_eq!(encode_unit(-0.5), 0);
        assert_eq!(encode_unit(2.0), 255);
    }

    #[test]
    fn sensor_scale_divides_by_full_scale_ratio() {
        let scale = SensorScale::new(4, 2000);
        assert_relative_eq!(scale.accel([8192, 0, 0]).x, 1.0);
        assert_relative_eq!(scale.gyro([32767, 0, 0]).x, 2000.0 * 32767.0 / 32768.0, epsilon = 1e-2);
    }

    #[test]
    fn unknown_scale_passes_raw_values() {
        let scale = SensorScale::new(0, 2000);
        assert_eq!(scale.accel([100, -5, 3]), Vec3::new(100.0, -5.0, 3.0));
        assert_eq!(scale.gyro([1, 2, 3]), Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn short_frame_is_reported() {
        assert_eq!(
            ensure_len(&[0u8; 3], 8),
            Err(CodecError::ShortFrame {
                expected: 8,
                actual: 3
            })
        );
    }

    proptest! {
        #[test]
        fn axis_survives_decode_encode(raw in any::<i16>()) {
            let back = encode_axis(decode_axis(raw));
            prop_assert!((i32::from(back) - i32::from(raw)).abs() <= 1);
        }
    }
}
