//! Raw ADC value to pressure conversion
//!
//! The transmitter is a 4-20 mA current-loop device. The conversion runs in
//! three linear stages:
//!
//! 1. raw counts -> voltage at the ADC pin
//! 2. voltage -> loop current, with full scale mapped to 20 mA
//! 3. loop current -> pressure, by interpolating between the 4 mA and 20 mA
//!    calibration points
//!
//! No clamping is applied anywhere. A broken loop (0 mA) extrapolates below the
//! calibrated floor, which keeps wiring faults visible on the dashboard.
//!
//! All arithmetic is `f32` and evaluated in a fixed order, so a given raw value
//! always produces the same bit pattern.

use serde::{Deserialize, Serialize};

/// ADC reference voltage in volts
pub const REFERENCE_VOLTAGE: f32 = 3.3;

/// Full-scale count of the 12-bit ADC
pub const ADC_FULL_SCALE: f32 = 4095.0;

/// Loop current corresponding to a full-scale ADC reading
pub const LOOP_FULL_SCALE_MA: f32 = 20.0;

/// Lower calibration point: 4 mA reads as 16 mbar
pub const CURRENT_MIN_MA: f32 = 4.0;
pub const PRESSURE_MIN_MBAR: f32 = 16.0;

/// Upper calibration point: 20 mA reads as 2341 mbar (16 mbar + 2325 mbar span)
pub const CURRENT_MAX_MA: f32 = 20.0;
pub const PRESSURE_MAX_MBAR: f32 = 2341.0;

/// Calibration constants for the three-stage conversion
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub reference_voltage: f32,
    pub adc_full_scale: f32,
    pub loop_full_scale_ma: f32,
    pub current_min_ma: f32,
    pub current_max_ma: f32,
    pub pressure_min: f32,
    pub pressure_max: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            reference_voltage: REFERENCE_VOLTAGE,
            adc_full_scale: ADC_FULL_SCALE,
            loop_full_scale_ma: LOOP_FULL_SCALE_MA,
            current_min_ma: CURRENT_MIN_MA,
            current_max_ma: CURRENT_MAX_MA,
            pressure_min: PRESSURE_MIN_MBAR,
            pressure_max: PRESSURE_MAX_MBAR,
        }
    }
}

impl Calibration {
    /// Stage 1: voltage at the ADC pin for a raw reading
    pub fn voltage(&self, raw: u16) -> f32 {
        f32::from(raw) * (self.reference_voltage / self.adc_full_scale)
    }

    /// Stage 2: loop current in milliamps for a pin voltage
    pub fn loop_current_ma(&self, voltage: f32) -> f32 {
        voltage / self.reference_voltage * self.loop_full_scale_ma
    }

    /// Stage 3: pressure for a loop current, linear through both calibration points
    pub fn pressure_from_current(&self, current_ma: f32) -> f32 {
        self.pressure_min
            + (current_ma - self.current_min_ma) * (self.pressure_max - self.pressure_min)
                / (self.current_max_ma - self.current_min_ma)
    }

    /// Full pipeline: raw reading to pressure
    pub fn to_pressure(&self, raw: u16) -> f32 {
        self.pressure_from_current(self.loop_current_ma(self.voltage(raw)))
    }

    /// Whether the constants describe a usable (non-degenerate) pipeline.
    ///
    /// Every constant must be finite, the scale factors positive, and both
    /// calibration spans non-zero.
    pub fn is_valid(&self) -> bool {
        let fields = [
            self.reference_voltage,
            self.adc_full_scale,
            self.loop_full_scale_ma,
            self.current_min_ma,
            self.current_max_ma,
            self.pressure_min,
            self.pressure_max,
        ];

        fields.iter().all(|v| v.is_finite())
            && self.reference_voltage > 0.0
            && self.adc_full_scale > 0.0
            && self.loop_full_scale_ma > 0.0
            && self.current_max_ma != self.current_min_ma
            && self.pressure_max != self.pressure_min
    }
}
