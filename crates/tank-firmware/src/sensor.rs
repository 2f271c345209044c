//! Pressure transmitter input
//!
//! The 4-20 mA loop is dropped across a shunt into ADC1 channel 3 (GPIO4).
//! With 11 dB attenuation the 12-bit reading covers the full shunt voltage.

use esp_hal::analog::adc::{Adc, AdcConfig, AdcPin, Attenuation};
use esp_hal::peripherals::{ADC1, GPIO4};
use log::warn;
use tank_core::AnalogChannel;

pub type PressureAdc = Adc<'static, ADC1<'static>, esp_hal::Blocking>;
pub type PressureAdcPin = AdcPin<GPIO4<'static>, ADC1<'static>>;

pub struct PressureChannel {
    adc: PressureAdc,
    pin: PressureAdcPin,
}

impl PressureChannel {
    pub fn new(adc1: ADC1<'static>, gpio: GPIO4<'static>) -> Self {
        let mut config = AdcConfig::new();
        let pin = config.enable_pin(gpio, Attenuation::_11dB);
        let adc = Adc::new(adc1, config);
        Self { adc, pin }
    }
}

impl AnalogChannel for PressureChannel {
    fn read_raw(&mut self) -> u16 {
        match nb::block!(self.adc.read_oneshot(&mut self.pin)) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("sensor: ADC conversion failed: {:?}", e);
                0
            }
        }
    }
}
