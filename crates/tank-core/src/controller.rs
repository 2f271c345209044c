//! The node's control loop
//!
//! [`Controller`] is the single context that owns every piece of device state:
//! the sensor channel, the actuator, the Wi-Fi link, the broker session and
//! the delay source. One cycle runs these steps in order:
//!
//! 1. sample the sensor and convert to pressure
//! 2. publish the formatted pressure on the telemetry topic
//! 3. verify connectivity (session first, then link)
//! 4. publish `"L"` if the actuator is on
//! 5. service the session, which dispatches remote commands
//! 6. sleep for the cycle interval
//!
//! The telemetry publish in step 2 deliberately happens before connectivity is
//! re-checked. If the session died since the previous cycle, that publish is
//! dropped and the reading is lost; the next cycle publishes on the restored
//! session.

use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use log::{info, warn};

use crate::command::{ActuatorState, CommandHandler};
use crate::config::NodeConfig;
use crate::link::{LinkManager, LinkState, NetworkInterface};
use crate::payload::{ACTUATOR_ON_PAYLOAD, TelemetryPayload, format_pressure};
use crate::sampler::{AnalogChannel, Sampler};
use crate::session::{BrokerClient, SessionManager, SessionState};

/// Coarse run state, logged on change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// No Wi-Fi link, either still booting or after the link was lost
    Booting,
    /// Wi-Fi associated, no broker session yet
    LinkUp,
    /// Broker session open
    Online,
}

/// What a single control-loop cycle did
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub raw: u16,
    pub pressure_mbar: f32,
    pub payload: TelemetryPayload,
    /// The pressure publish was accepted by the transport
    pub telemetry_published: bool,
    /// The actuator-on notification was published this cycle
    pub actuator_notified: bool,
    /// Remote commands dispatched while servicing the session
    pub commands_handled: usize,
}

pub struct Controller<'a, A, P, N, B, D> {
    config: NodeConfig<'a>,
    sampler: Sampler,
    channel: A,
    commands: CommandHandler<P>,
    network: N,
    link: LinkManager<'a>,
    broker: B,
    session: SessionManager<'a>,
    delay: D,
    state: NodeState,
}

impl<'a, A, P, N, B, D> Controller<'a, A, P, N, B, D>
where
    A: AnalogChannel,
    P: OutputPin,
    N: NetworkInterface,
    B: BrokerClient,
    D: DelayNs,
{
    pub fn new(
        config: NodeConfig<'a>,
        channel: A,
        actuator: P,
        network: N,
        broker: B,
        delay: D,
    ) -> Self {
        Self {
            sampler: Sampler::new(config.sampler),
            channel,
            commands: CommandHandler::new(actuator),
            network,
            link: LinkManager::new(config.wifi, config.timing.link_poll_interval_ms),
            broker,
            session: SessionManager::new(config.broker, config.timing.session_retry_delay_ms),
            delay,
            state: NodeState::Booting,
            config,
        }
    }

    pub fn config(&self) -> &NodeConfig<'a> {
        &self.config
    }

    pub fn node_state(&self) -> NodeState {
        self.state
    }

    pub fn actuator_state(&self) -> ActuatorState {
        self.commands.state()
    }

    pub fn link(&self) -> &LinkManager<'a> {
        &self.link
    }

    pub fn session(&self) -> &SessionManager<'a> {
        &self.session
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut N {
        &mut self.network
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    pub fn actuator(&self) -> &P {
        self.commands.pin()
    }

    pub fn delay(&self) -> &D {
        &self.delay
    }

    /// Boot sequence: actuator inactive, then block until the link is up.
    ///
    /// The broker session is not opened here; the first cycle's connectivity
    /// check does that.
    pub async fn start(&mut self) {
        self.commands.init();
        info!(
            "node: starting, client '{}' -> {}:{}",
            self.config.broker.client_id, self.config.broker.host, self.config.broker.port
        );

        self.link
            .ensure_connected(&mut self.network, &mut self.delay)
            .await;
        self.set_state(NodeState::LinkUp);
    }

    /// Run forever: boot, then one cycle per `cycle_interval_ms`.
    pub async fn run(&mut self) -> ! {
        self.start().await;
        loop {
            self.run_cycle().await;
            self.delay.delay_ms(self.config.timing.cycle_interval_ms).await;
        }
    }

    /// Sample the sensor and convert the averaged reading to pressure.
    pub async fn sample(&mut self) -> (u16, f32) {
        let raw = self
            .sampler
            .read_averaged(&mut self.channel, &mut self.delay)
            .await;
        let pressure = self.config.calibration.to_pressure(raw);
        info!("pressure: {:.2} mbar (raw {})", pressure, raw);
        (raw, pressure)
    }

    /// Re-establish whatever is down: the broker session if it is closed,
    /// then the Wi-Fi link regardless.
    ///
    /// When both are up this only queries status; it never reconnects or
    /// re-subscribes. A loss is reflected in [`NodeState`] before the retry
    /// loop for it starts.
    pub async fn verify_connectivity(&mut self) {
        if !self.session.is_connected(&self.broker) {
            self.settle_state();
            self.session
                .ensure_session(&mut self.broker, &mut self.delay)
                .await;
        }
        if !self.link.refresh(&mut self.network).await {
            self.settle_state();
            self.link
                .ensure_connected(&mut self.network, &mut self.delay)
                .await;
        }
        self.settle_state();
    }

    /// Query the session and link status without reconnecting either, and
    /// move the node state to match.
    pub async fn refresh_state(&mut self) -> NodeState {
        self.session.is_connected(&self.broker);
        self.link.refresh(&mut self.network).await;
        self.settle_state();
        self.state
    }

    /// One cycle of the loop, without the trailing sleep.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let (raw, pressure_mbar) = self.sample().await;

        let payload = format_pressure(pressure_mbar, self.config.payload_format);
        let telemetry_topic = self.config.broker.telemetry_topic;
        let telemetry_published = self
            .session
            .publish(&mut self.broker, telemetry_topic, payload.as_bytes())
            .await
            .inspect_err(|e| warn!("telemetry: pressure not sent: {}", e))
            .is_ok();

        self.verify_connectivity().await;

        let actuator_notified = if self.commands.state() == ActuatorState::On {
            self.session
                .publish(
                    &mut self.broker,
                    telemetry_topic,
                    ACTUATOR_ON_PAYLOAD.as_bytes(),
                )
                .await
                .inspect_err(|e| warn!("telemetry: actuator state not sent: {}", e))
                .is_ok()
        } else {
            false
        };

        let commands = &mut self.commands;
        let commands_handled = self
            .session
            .service(&mut self.broker, |topic, message| {
                commands.handle(topic, message);
            })
            .await;

        CycleReport {
            raw,
            pressure_mbar,
            payload,
            telemetry_published,
            actuator_notified,
            commands_handled,
        }
    }

    /// Derive the node state from the last known link and session states.
    fn settle_state(&mut self) {
        let state = if self.link.state() != LinkState::Connected {
            NodeState::Booting
        } else if self.session.state() == SessionState::Connected {
            NodeState::Online
        } else {
            NodeState::LinkUp
        };
        self.set_state(state);
    }

    fn set_state(&mut self, state: NodeState) {
        if self.state != state {
            info!("node: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}
