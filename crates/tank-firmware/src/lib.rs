//! ESP32-S3 firmware-specific modules for the tank node
//!
//! Concrete implementations of the `tank-core` hardware seams: the ADC
//! channel the pressure transmitter is wired to, the Wi-Fi station interface
//! and the MQTT client running over embassy-net.

#![no_std]

extern crate alloc;

pub mod mqtt;
pub mod sensor;
pub mod wifi;
