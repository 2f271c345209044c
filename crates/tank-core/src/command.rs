//! Remote actuator commands
//!
//! The command topic carries single-letter text messages: `"L"` switches the
//! actuator on and `"D"` switches it off. The relay board is driven active
//! low, so "on" pulls the output pin LOW and "off" drives it HIGH. Anything
//! else on the topic is ignored.

use embedded_hal::digital::OutputPin;
use log::{debug, info, warn};

/// Logical actuator state as last commanded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActuatorState {
    #[default]
    Off,
    On,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `"L"`: pin LOW, state On
    On,
    /// `"D"`: pin HIGH, state Off
    Off,
}

impl Command {
    /// Decode a command payload. Only the exact texts `"L"` and `"D"` are
    /// recognized; invalid UTF-8 or any other text yields `None`.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match core::str::from_utf8(payload).ok()? {
            "L" => Some(Self::On),
            "D" => Some(Self::Off),
            _ => None,
        }
    }
}

/// Owns the actuator output and the state derived from remote commands
pub struct CommandHandler<P> {
    pin: P,
    state: ActuatorState,
}

impl<P: OutputPin> CommandHandler<P> {
    pub const fn new(pin: P) -> Self {
        Self {
            pin,
            state: ActuatorState::Off,
        }
    }

    pub fn state(&self) -> ActuatorState {
        self.state
    }

    pub fn pin(&self) -> &P {
        &self.pin
    }

    /// Drive the output to its inactive (HIGH) level. Called once at boot.
    pub fn init(&mut self) {
        if let Err(e) = self.pin.set_high() {
            warn!("actuator: failed to drive output inactive: {:?}", e);
        }
        self.state = ActuatorState::Off;
    }

    /// Handle a message received on the command topic.
    ///
    /// Returns the command that was applied, or `None` if the message was
    /// not recognized and nothing changed.
    pub fn handle(&mut self, topic: &str, payload: &[u8]) -> Option<Command> {
        let Some(command) = Command::parse(payload) else {
            debug!("actuator: ignoring unrecognized message on '{}'", topic);
            return None;
        };

        self.apply(command);
        Some(command)
    }

    pub fn apply(&mut self, command: Command) {
        let result = match command {
            Command::On => self.pin.set_low(),
            Command::Off => self.pin.set_high(),
        };
        if let Err(e) = result {
            warn!("actuator: failed to drive output for {:?}: {:?}", command, e);
        }

        self.state = match command {
            Command::On => ActuatorState::On,
            Command::Off => ActuatorState::Off,
        };
        info!("actuator: {:?}", self.state);
    }
}
