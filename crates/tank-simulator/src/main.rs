//! Desktop simulator for the tank pressure telemetry node.
//!
//! Runs the real `tank-core` control loop against simulated hardware: a
//! 4-20 mA transmitter following a slow synthetic pressure curve, a Wi-Fi
//! radio, an in-process MQTT broker and a relay. Time is virtual and scaled
//! down, so a minute of node time passes in a few seconds.
//!
//! A fixed fault schedule exercises the recovery paths:
//!
//! | Cycle | Event                                          |
//! |-------|------------------------------------------------|
//! | 8     | broker drops the session, refuses 2 reconnects |
//! | 12    | operator sends `L` (relay on)                  |
//! | 18    | access point disappears for a while            |
//! | 26    | operator sends `D` (relay off)                 |
//! | 30    | operator sends `X` (ignored)                   |
//!
//! The schedule repeats every 40 cycles. Usage:
//!
//! ```text
//! RUST_LOG=debug cargo run -p tank-simulator -- [cycles]
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use embassy_futures::block_on;
use embedded_hal::digital::{ErrorType, OutputPin};
use embedded_hal_async::delay::DelayNs;
use log::{info, warn};

use tank_core::{
    AnalogChannel, BrokerClient, Calibration, Controller, InboundMessage, NetworkInterface,
    NodeConfig, WifiConfig,
};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Wall-clock seconds per simulated second
const TIME_SCALE: f64 = 0.05;

/// Cycles to run when none are given on the command line
const DEFAULT_CYCLES: u32 = 40;

/// Length of the fault schedule, in cycles
const SCHEDULE_PERIOD: u32 = 40;

/// Status checks an association takes to complete
const ASSOCIATION_CHECKS: u32 = 3;

/// Status checks the access point stays away during an outage
const OUTAGE_CHECKS: u32 = 6;

const SIMULATED_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 20);

#[derive(Debug)]
enum SimError {
    NoAccessPoint,
    NoRoute,
    Refused,
    Offline,
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Shared virtual clock in milliseconds, advanced only by [`ScaledDelay`]
type Clock = Rc<Cell<u64>>;

struct ScaledDelay {
    clock: Clock,
}

impl DelayNs for ScaledDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.clock.set(self.clock.get() + u64::from(ns) / 1_000_000);
        std::thread::sleep(Duration::from_secs_f64(f64::from(ns) * 1e-9 * TIME_SCALE));
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.clock.set(self.clock.get() + u64::from(ms));
        std::thread::sleep(Duration::from_secs_f64(f64::from(ms) * 1e-3 * TIME_SCALE));
    }
}

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

/// Transmitter on the ADC pin, reporting a pressure curve plus a little noise.
struct Transmitter {
    clock: Clock,
    calibration: Calibration,
    noise_state: u32,
}

impl Transmitter {
    fn new(clock: Clock, calibration: Calibration) -> Self {
        Self {
            clock,
            calibration,
            noise_state: 0x2545_f491,
        }
    }

    /// Tank pressure in mbar at simulated time `t` seconds
    fn pressure_at(t: f64) -> f64 {
        900.0 + 450.0 * (t / 90.0).sin() + 60.0 * (t / 17.0).cos()
    }

    /// Small deterministic noise in ADC counts, in `-3..=3`
    fn noise(&mut self) -> i32 {
        self.noise_state ^= self.noise_state << 13;
        self.noise_state ^= self.noise_state >> 17;
        self.noise_state ^= self.noise_state << 5;
        (self.noise_state % 7) as i32 - 3
    }
}

impl AnalogChannel for Transmitter {
    fn read_raw(&mut self) -> u16 {
        let cal = self.calibration;
        let t = self.clock.get() as f64 / 1000.0;

        let pressure = Self::pressure_at(t);
        let current = f64::from(cal.current_min_ma)
            + (pressure - f64::from(cal.pressure_min))
                * f64::from(cal.current_max_ma - cal.current_min_ma)
                / f64::from(cal.pressure_max - cal.pressure_min);
        let raw = current / f64::from(cal.loop_full_scale_ma) * f64::from(cal.adc_full_scale);

        (raw.round() as i32 + self.noise()).clamp(0, cal.adc_full_scale as i32) as u16
    }
}

// ---------------------------------------------------------------------------
// Radio and network
// ---------------------------------------------------------------------------

/// The radio environment, shared by the Wi-Fi interface and the broker.
///
/// Time here is counted in status checks. Once configured, the driver
/// re-associates by itself when the access point comes back.
#[derive(Default)]
struct Radio {
    configured: bool,
    associated: bool,
    pending: Option<u32>,
    outage: u32,
}

impl Radio {
    fn tick(&mut self) {
        if self.outage > 0 {
            self.outage -= 1;
            if self.outage == 0 && self.configured {
                info!("radio: access point back, driver re-associated");
                self.associated = true;
                self.pending = None;
            }
            return;
        }

        match self.pending {
            Some(0) => {
                self.associated = true;
                self.pending = None;
            }
            Some(remaining) => self.pending = Some(remaining - 1),
            None => {}
        }
    }

    fn begin(&mut self) -> Result<(), SimError> {
        self.configured = true;
        if self.outage > 0 {
            return Err(SimError::NoAccessPoint);
        }
        if !self.associated {
            self.pending = Some(ASSOCIATION_CHECKS);
        }
        Ok(())
    }

    fn start_outage(&mut self, checks: u32) {
        warn!("radio: access point gone");
        self.associated = false;
        self.pending = None;
        self.outage = checks;
    }
}

struct SimulatedWifi {
    radio: Rc<RefCell<Radio>>,
}

impl NetworkInterface for SimulatedWifi {
    type Error = SimError;

    async fn begin(&mut self, _ssid: &str, _password: &str) -> Result<(), Self::Error> {
        self.radio.borrow_mut().begin()
    }

    async fn is_connected(&mut self) -> bool {
        let mut radio = self.radio.borrow_mut();
        radio.tick();
        radio.associated
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.radio.borrow().associated.then_some(SIMULATED_ADDRESS)
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// In-process broker with a single client: the node.
struct SimulatedBroker {
    radio: Rc<RefCell<Radio>>,
    connected: bool,
    refusals: u32,
    subscriptions: Vec<String>,
    inbox: VecDeque<InboundMessage>,
    delivered: u32,
}

impl SimulatedBroker {
    fn new(radio: Rc<RefCell<Radio>>) -> Self {
        Self {
            radio,
            connected: false,
            refusals: 0,
            subscriptions: Vec::new(),
            inbox: VecDeque::new(),
            delivered: 0,
        }
    }

    fn drop_session(&mut self, refusals: u32) {
        warn!("broker: dropping session, refusing next {} connects", refusals);
        self.connected = false;
        self.refusals = refusals;
    }

    /// Another client publishes on `topic`. QoS 0: lost unless the node is
    /// connected and subscribed right now.
    fn remote_publish(&mut self, topic: &str, payload: &str) {
        let subscribed = self.subscriptions.iter().any(|t| t == topic);
        if !(self.is_connected() && subscribed) {
            warn!("broker: '{}' on '{}' not delivered", payload, topic);
            return;
        }
        match InboundMessage::new(topic, payload.as_bytes()) {
            Some(message) => {
                info!("broker: operator sent '{}' on '{}'", payload, topic);
                self.inbox.push_back(message);
            }
            None => warn!("broker: message on '{}' too large", topic),
        }
    }
}

impl BrokerClient for SimulatedBroker {
    type Error = SimError;

    async fn connect(&mut self, host: &str, port: u16, client_id: &str) -> Result<(), Self::Error> {
        let mut radio = self.radio.borrow_mut();
        radio.tick();
        if !radio.associated {
            return Err(SimError::NoRoute);
        }
        if self.refusals > 0 {
            self.refusals -= 1;
            return Err(SimError::Refused);
        }

        info!("broker: '{}' connected to {}:{}", client_id, host, port);
        self.connected = true;
        self.subscriptions.clear();
        self.inbox.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected && self.radio.borrow().associated
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        if !self.is_connected() {
            return Err(SimError::Offline);
        }
        self.subscriptions.push(topic.to_owned());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), Self::Error> {
        if !self.is_connected() {
            return Err(SimError::Offline);
        }
        self.delivered += 1;
        info!("broker: {} <- '{}'", topic, String::from_utf8_lossy(payload));
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<InboundMessage>, Self::Error> {
        if !self.is_connected() {
            return Err(SimError::Offline);
        }
        Ok(self.inbox.pop_front())
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Relay {
    energized: Option<bool>,
}

impl Relay {
    fn set(&mut self, energized: bool) {
        if self.energized != Some(energized) {
            info!("relay: {}", if energized { "energized" } else { "released" });
        }
        self.energized = Some(energized);
    }
}

impl ErrorType for Relay {
    type Error = Infallible;
}

/// Active-low input: LOW energizes the relay.
impl OutputPin for Relay {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set(true);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set(false);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

type SimulatedNode<'a> =
    Controller<'a, Transmitter, Relay, SimulatedWifi, SimulatedBroker, ScaledDelay>;

fn inject_faults(cycle: u32, node: &mut SimulatedNode<'_>, radio: &RefCell<Radio>) {
    let command_topic = node.config().broker.command_topic;

    match cycle % SCHEDULE_PERIOD {
        8 => node.broker_mut().drop_session(2),
        12 => node.broker_mut().remote_publish(command_topic, "L"),
        18 => radio.borrow_mut().start_outage(OUTAGE_CHECKS),
        26 => node.broker_mut().remote_publish(command_topic, "D"),
        30 => node.broker_mut().remote_publish(command_topic, "X"),
        _ => {}
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cycles = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_CYCLES);

    info!("Starting tank simulator ({} cycles, time scale {})", cycles, TIME_SCALE);

    let config = NodeConfig {
        wifi: WifiConfig {
            ssid: "simulated-ap",
            password: "simulated",
        },
        ..NodeConfig::default()
    };
    if let Err(e) = config.validate() {
        log::error!("config: {}", e);
        return;
    }

    let clock: Clock = Rc::new(Cell::new(0));
    let radio = Rc::new(RefCell::new(Radio::default()));

    let mut node = Controller::new(
        config,
        Transmitter::new(clock.clone(), config.calibration),
        Relay::default(),
        SimulatedWifi {
            radio: radio.clone(),
        },
        SimulatedBroker::new(radio.clone()),
        ScaledDelay {
            clock: clock.clone(),
        },
    );

    block_on(node.start());

    for cycle in 1..=cycles {
        let report = block_on(node.run_cycle());
        info!(
            "cycle {:>3} @ {:>6.1}s: raw {:>4} -> '{}' sent={} relay={:?} commands={} state={:?}",
            cycle,
            clock.get() as f64 / 1000.0,
            report.raw,
            report.payload,
            report.telemetry_published,
            node.actuator_state(),
            report.commands_handled,
            node.node_state(),
        );

        inject_faults(cycle, &mut node, &radio);
        block_on(ScaledDelay {
            clock: clock.clone(),
        }
        .delay_ms(node.config().timing.cycle_interval_ms));
    }

    let link = node.link().stats();
    let session = node.session().stats();
    info!(
        "Simulator exiting: link {} attempts / {} connects, session {} attempts / {} connects, \
         {} inbound, {} messages delivered",
        link.attempts,
        link.connects,
        session.attempts,
        session.connects,
        session.messages,
        node.broker().delivered,
    );
}
