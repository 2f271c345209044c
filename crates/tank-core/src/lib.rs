//! Hardware-independent core library for the tank pressure node
//!
//! This crate contains all platform-agnostic logic for the tank telemetry
//! device: analog sampling, the current-loop to pressure conversion, telemetry
//! formatting, the Wi-Fi link and MQTT session state machines, remote command
//! handling, and the control loop that ties them together.
//!
//! Hardware is reached through small seam traits ([`sampler::AnalogChannel`],
//! [`link::NetworkInterface`], [`session::BrokerClient`]) plus the
//! `embedded-hal` output pin and async delay traits, so the same code runs on
//! the ESP32-S3 firmware and on desktop hosts (for the simulator and tests).

#![cfg_attr(not(test), no_std)]

pub mod command;
pub mod config;
pub mod controller;
pub mod conversion;
pub mod link;
pub mod payload;
pub mod sampler;
pub mod session;

#[cfg(test)]
mod mock;

pub use command::{ActuatorState, Command, CommandHandler};
pub use config::{BrokerConfig, ConfigError, NodeConfig, TimingConfig, WifiConfig};
pub use controller::{Controller, CycleReport, NodeState};
pub use conversion::Calibration;
pub use link::{LinkManager, LinkState, NetworkInterface};
pub use payload::{PayloadFormat, TelemetryPayload, format_pressure};
pub use sampler::{AnalogChannel, Sampler, SamplerConfig};
pub use session::{BrokerClient, InboundMessage, SessionError, SessionManager, SessionState};
