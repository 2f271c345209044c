//! Telemetry payload formatting
//!
//! The existing dashboard parses the pressure payload produced by the first
//! generation of this node: the value printed with one decimal, cut down to
//! its first three characters, followed by the unit. `888.23` is sent as
//! `"888 mbar"`, `16.0` as `"16. mbar"`, and anything above 999 loses its
//! trailing digits (`1234.5` -> `"123 mbar"`).
//!
//! [`PayloadFormat::Truncated`] reproduces that byte for byte and is the
//! default. [`PayloadFormat::Full`] sends the whole value for consumers that
//! can cope with it.

use core::fmt::Write;

use serde::{Deserialize, Serialize};

/// Unit suffix appended to every pressure payload
pub const PRESSURE_UNIT: &str = " mbar";

/// Characters of the rendered value kept in truncated mode
pub const TRUNCATED_VALUE_CHARS: usize = 3;

/// Payload announcing that the actuator is on
pub const ACTUATOR_ON_PAYLOAD: &str = "L";

/// Large enough for any `f32` rendered with one decimal plus the unit
pub const PAYLOAD_CAPACITY: usize = 48;

/// Scratch size for the rendered value alone
const VALUE_CAPACITY: usize = PAYLOAD_CAPACITY - PRESSURE_UNIT.len();

pub type TelemetryPayload = heapless::String<PAYLOAD_CAPACITY>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    /// First three characters of the one-decimal value, then the unit
    #[default]
    Truncated,
    /// Complete one-decimal value, then the unit
    Full,
}

impl PayloadFormat {
    /// Parse a build-time setting. Accepts `truncated` or `full`, in any case.
    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("truncated") {
            Some(Self::Truncated)
        } else if name.eq_ignore_ascii_case("full") {
            Some(Self::Full)
        } else {
            None
        }
    }
}

/// Render a pressure reading into a telemetry payload.
pub fn format_pressure(pressure_mbar: f32, format: PayloadFormat) -> TelemetryPayload {
    let mut value = heapless::String::<VALUE_CAPACITY>::new();
    // An f32 with one decimal is at most 41 characters, so this cannot fail
    let _ = write!(value, "{:.1}", pressure_mbar);

    let kept = match format {
        PayloadFormat::Truncated => value.get(..TRUNCATED_VALUE_CHARS).unwrap_or(value.as_str()),
        PayloadFormat::Full => value.as_str(),
    };

    let mut payload = TelemetryPayload::new();
    let _ = payload.push_str(kept);
    let _ = payload.push_str(PRESSURE_UNIT);
    payload
}
