//! Node configuration
//!
//! Everything the node needs is compiled in. The firmware fills the Wi-Fi
//! and broker fields from build-time environment variables; the remaining
//! fields default to the values the deployed units were commissioned with.

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::conversion::Calibration;
use crate::payload::PayloadFormat;
use crate::sampler::SamplerConfig;

pub const DEFAULT_BROKER_HOST: &str = "broker.hivemq.com";
pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_CLIENT_ID: &str = "TANQUE";
pub const DEFAULT_COMMAND_TOPIC: &str = "MQTT_TANK_IN";
pub const DEFAULT_TELEMETRY_TOPIC: &str = "TANQUE_RENASCENCA";

pub const DEFAULT_LINK_POLL_INTERVAL_MS: u32 = 100;
pub const DEFAULT_SESSION_RETRY_DELAY_MS: u32 = 2_000;
pub const DEFAULT_CYCLE_INTERVAL_MS: u32 = 1_000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
#[serde(bound(deserialize = "'de: 'a"))]
pub struct NodeConfig<'a> {
    pub wifi: WifiConfig<'a>,
    pub broker: BrokerConfig<'a>,
    pub sampler: SamplerConfig,
    pub calibration: Calibration,
    pub timing: TimingConfig,
    pub payload_format: PayloadFormat,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WifiConfig<'a> {
    pub ssid: &'a str,
    pub password: &'a str,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig<'a> {
    pub host: &'a str,
    pub port: u16,
    pub client_id: &'a str,
    /// Topic the node subscribes to for remote commands
    pub command_topic: &'a str,
    /// Topic the node publishes pressure and actuator state on
    pub telemetry_topic: &'a str,
}

impl Default for BrokerConfig<'_> {
    fn default() -> Self {
        Self {
            host: DEFAULT_BROKER_HOST,
            port: DEFAULT_BROKER_PORT,
            client_id: DEFAULT_CLIENT_ID,
            command_topic: DEFAULT_COMMAND_TOPIC,
            telemetry_topic: DEFAULT_TELEMETRY_TOPIC,
        }
    }
}

/// Fixed delays of the connection state machines and the control loop
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    /// Interval between Wi-Fi status polls while associating
    pub link_poll_interval_ms: u32,
    /// Backoff between failed broker connection attempts
    pub session_retry_delay_ms: u32,
    /// Sleep at the end of every control-loop cycle
    pub cycle_interval_ms: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            link_poll_interval_ms: DEFAULT_LINK_POLL_INTERVAL_MS,
            session_retry_delay_ms: DEFAULT_SESSION_RETRY_DELAY_MS,
            cycle_interval_ms: DEFAULT_CYCLE_INTERVAL_MS,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Wi-Fi SSID is empty")]
    MissingSsid,
    #[error("Broker host is empty")]
    MissingBrokerHost,
    #[error("MQTT client id is empty")]
    MissingClientId,
    #[error("Topic is empty: {name}")]
    MissingTopic { name: &'static str },
    #[error("Sampler reading count must be at least 1")]
    NoReadings,
    #[error("Calibration constants are degenerate")]
    InvalidCalibration,
}

impl NodeConfig<'_> {
    /// Check the configuration for values the node cannot run with.
    ///
    /// The firmware calls this once at boot and refuses to start the loop
    /// on error, since every field is compiled in and cannot change later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wifi.ssid.is_empty() {
            return Err(ConfigError::MissingSsid);
        }
        if self.broker.host.is_empty() {
            return Err(ConfigError::MissingBrokerHost);
        }
        if self.broker.client_id.is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        if self.broker.command_topic.is_empty() {
            return Err(ConfigError::MissingTopic {
                name: "command",
            });
        }
        if self.broker.telemetry_topic.is_empty() {
            return Err(ConfigError::MissingTopic {
                name: "telemetry",
            });
        }
        if self.sampler.reading_count == 0 {
            return Err(ConfigError::NoReadings);
        }
        if !self.calibration.is_valid() {
            return Err(ConfigError::InvalidCalibration);
        }
        Ok(())
    }
}
