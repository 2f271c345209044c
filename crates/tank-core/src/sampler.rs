//! Averaged analog sampling
//!
//! The pressure transmitter's current loop is read through a shunt on an ADC
//! pin. Single conversions are noisy, so every telemetry sample is the mean of
//! a burst of readings taken with a short settle delay in between.

use embedded_hal_async::delay::DelayNs;
use serde::{Deserialize, Serialize};

/// Number of readings averaged per sample
pub const DEFAULT_READING_COUNT: u16 = 30;

/// Delay after each reading to let the input settle
pub const DEFAULT_SETTLE_DELAY_MS: u32 = 10;

/// A single analog input channel.
///
/// Reads are infallible: a channel that cannot be read is expected to hand
/// back whatever the converter produced. Bad wiring shows up as bad telemetry,
/// not as an error.
pub trait AnalogChannel {
    /// Take one raw conversion from the channel.
    fn read_raw(&mut self) -> u16;
}

impl<T: AnalogChannel + ?Sized> AnalogChannel for &mut T {
    fn read_raw(&mut self) -> u16 {
        (**self).read_raw()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerConfig {
    pub reading_count: u16,
    pub settle_delay_ms: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            reading_count: DEFAULT_READING_COUNT,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
        }
    }
}

/// Burst sampler producing one averaged raw value per call
#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    config: SamplerConfig,
}

impl Sampler {
    pub const fn new(config: SamplerConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Read the channel `reading_count` times and return the truncated mean.
    ///
    /// A zero reading count is treated as a single reading.
    pub async fn read_averaged<A, D>(&self, channel: &mut A, delay: &mut D) -> u16
    where
        A: AnalogChannel,
        D: DelayNs,
    {
        let count = self.config.reading_count.max(1);

        // u16::MAX * u16::MAX still fits in a u32
        let mut sum: u32 = 0;
        for _ in 0..count {
            sum += u32::from(channel.read_raw());
            delay.delay_ms(self.config.settle_delay_ms).await;
        }

        (sum / u32::from(count)) as u16
    }
}
