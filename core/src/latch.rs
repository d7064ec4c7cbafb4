//! Latches - one frame of player input for one entity

use bitflags::bitflags;

use crate::constants::SHORTLATCH;

bitflags! {
    /// Buttons held during a frame
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct LatchButtons: u8 {
        /// use the item in the left hand
        const LEFT = 1 << 0;
        /// use the item in the right hand
        const RIGHT = 1 << 1;
        const JUMP = 1 << 2;
        /// grab/drop with the left hand
        const ALTLEFT = 1 << 3;
        /// grab/drop with the right hand
        const ALTRIGHT = 1 << 4;
        /// cycle the pack into the left hand
        const PACKLEFT = 1 << 5;
        /// cycle the pack into the right hand
        const PACKRIGHT = 1 << 6;
        const RESPAWN = 1 << 7;
    }
}

/// Buttons plus motion deltas in [-1, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Latch {
    pub buttons: LatchButtons,
    pub x: f32,
    pub y: f32,
}

impl Latch {
    /// Builds a latch, clamping the motion into [-1, 1].
    pub fn new(buttons: LatchButtons, x: f32, y: f32) -> Self {
        Latch {
            buttons,
            x: clamp_unit(x),
            y: clamp_unit(y),
        }
    }

    /// The latch as the receiving side will see it after the wire trip.
    pub fn quantized(&self) -> Self {
        Latch {
            buttons: self.buttons,
            x: dequantize(quantize(self.x)),
            y: dequantize(quantize(self.y)),
        }
    }
}

/// A latch together with the frame it is meant for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedLatch {
    pub stamp: u32,
    pub latch: Latch,
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(-1.0, 1.0)
    }
}

/// Motion delta to its fixed-point wire value.
pub fn quantize(value: f32) -> i16 {
    let scaled = (value * SHORTLATCH).round();
    if scaled.is_nan() {
        return 0;
    }
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Fixed-point wire value back to a motion delta.
pub fn dequantize(value: i16) -> f32 {
    value as f32 / SHORTLATCH
}

#[cfg(test)]
mod tests {
    use super::{dequantize, quantize, Latch, LatchButtons};
    use crate::constants::SHORTLATCH;

    #[test]
    fn quantization_error_is_within_one_step() {
        let mut value = -1.0f32;
        while value <= 1.0 {
            let error = (dequantize(quantize(value)) - value).abs();
            assert!(error <= 1.0 / SHORTLATCH, "value={value} error={error}");
            value += 0.000_37;
        }
    }

    #[test]
    fn exact_binary_fractions_survive_quantization() {
        assert_eq!(dequantize(quantize(0.5)), 0.5);
        assert_eq!(dequantize(quantize(-0.5)), -0.5);
        assert_eq!(quantize(1.0), 1024);
        assert_eq!(quantize(-1.0), -1024);
    }

    #[test]
    fn quantize_saturates_to_i16_range() {
        assert_eq!(quantize(1000.0), i16::MAX);
        assert_eq!(quantize(-1000.0), i16::MIN);
        assert_eq!(quantize(f32::NAN), 0);
    }

    #[test]
    fn new_clamps_motion() {
        let latch = Latch::new(LatchButtons::JUMP, 3.0, f32::NAN);
        assert_eq!(latch.x, 1.0);
        assert_eq!(latch.y, 0.0);
        assert_eq!(latch.buttons, LatchButtons::JUMP);
    }
}
