//! In-memory stand-ins for the hardware seams, used by the unit tests

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::Ipv4Addr;

use embedded_hal::digital::{ErrorType, OutputPin};
use embedded_hal_async::delay::DelayNs;

use crate::link::NetworkInterface;
use crate::sampler::AnalogChannel;
use crate::session::{BrokerClient, InboundMessage};

/// Analog channel that replays a fixed sequence, wrapping around at the end
pub struct ScriptedChannel {
    readings: Vec<u16>,
    reads: usize,
}

impl ScriptedChannel {
    pub fn new(readings: &[u16]) -> Self {
        assert!(!readings.is_empty());
        Self {
            readings: readings.to_vec(),
            reads: 0,
        }
    }

    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl AnalogChannel for ScriptedChannel {
    fn read_raw(&mut self) -> u16 {
        let value = self.readings[self.reads % self.readings.len()];
        self.reads += 1;
        value
    }
}

/// Delay that returns immediately and accumulates virtual time
#[derive(Default)]
pub struct VirtualDelay {
    elapsed_ns: u64,
    calls: usize,
}

impl VirtualDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ns / 1_000_000
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl DelayNs for VirtualDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.calls += 1;
        self.elapsed_ns += u64::from(ns);
    }

    async fn delay_us(&mut self, us: u32) {
        self.calls += 1;
        self.elapsed_ns += u64::from(us) * 1_000;
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.calls += 1;
        self.elapsed_ns += u64::from(ms) * 1_000_000;
    }
}

/// Output pin that remembers its level and how often it was written
#[derive(Default)]
pub struct RecordingPin {
    level: Option<bool>,
    writes: usize,
}

impl RecordingPin {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the pin is first driven
    pub fn is_high(&self) -> Option<bool> {
        self.level
    }

    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl ErrorType for RecordingPin {
    type Error = Infallible;
}

impl OutputPin for RecordingPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.level = Some(false);
        self.writes += 1;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.level = Some(true);
        self.writes += 1;
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum MockError {
    Refused,
    Offline,
}

/// Wi-Fi interface that associates after a scripted number of status polls
pub struct ScriptedNetwork {
    connected: bool,
    associating: bool,
    association_polls: u32,
    remaining_polls: u32,
    failing_begins: u32,
    begins: u32,
    last_ssid: Option<String>,
}

impl ScriptedNetwork {
    /// Associations complete after `association_polls` negative status checks.
    pub fn new(association_polls: u32) -> Self {
        Self {
            connected: false,
            associating: false,
            association_polls,
            remaining_polls: 0,
            failing_begins: 0,
            begins: 0,
            last_ssid: None,
        }
    }

    /// An interface that is already associated before anyone asks.
    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Self::new(0)
        }
    }

    /// Lose the link; the next association takes `association_polls` polls.
    pub fn drop_link(&mut self, association_polls: u32) {
        self.connected = false;
        self.associating = false;
        self.association_polls = association_polls;
    }

    /// Make the next `count` association requests fail.
    pub fn fail_begins(&mut self, count: u32) {
        self.failing_begins = count;
    }

    pub fn begins(&self) -> u32 {
        self.begins
    }

    pub fn last_ssid(&self) -> Option<&str> {
        self.last_ssid.as_deref()
    }
}

impl NetworkInterface for ScriptedNetwork {
    type Error = MockError;

    async fn begin(&mut self, ssid: &str, _password: &str) -> Result<(), Self::Error> {
        self.begins += 1;
        self.last_ssid = Some(ssid.to_owned());
        if self.failing_begins > 0 {
            self.failing_begins -= 1;
            return Err(MockError::Refused);
        }
        self.associating = true;
        self.remaining_polls = self.association_polls;
        Ok(())
    }

    async fn is_connected(&mut self) -> bool {
        if self.connected {
            return true;
        }
        if !self.associating {
            return false;
        }
        if self.remaining_polls == 0 {
            self.associating = false;
            self.connected = true;
            return true;
        }
        self.remaining_polls -= 1;
        false
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.connected.then_some(Ipv4Addr::new(192, 168, 4, 20))
    }
}

/// Broker that lives in memory and records everything the node does
#[derive(Default)]
pub struct MemoryBroker {
    connected: bool,
    refusals: u32,
    subscribe_rejections: u32,
    connects: u32,
    subscribe_count: u32,
    polls: u32,
    endpoint: Option<(String, u16)>,
    client_id: Option<String>,
    subscriptions: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
    inbound: VecDeque<InboundMessage>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_connections(&mut self, count: u32) {
        self.refusals = count;
    }

    pub fn reject_subscriptions(&mut self, count: u32) {
        self.subscribe_rejections = count;
    }

    /// Close the connection from the broker side; subscriptions are lost.
    pub fn drop_connection(&mut self) {
        self.connected = false;
        self.subscriptions.clear();
    }

    /// Queue a message as if another client published it.
    pub fn inject(&mut self, topic: &str, payload: &[u8]) {
        let message = InboundMessage::new(topic, payload).expect("message fits");
        self.inbound.push_back(message);
    }

    pub fn connects(&self) -> u32 {
        self.connects
    }

    pub fn subscribe_count(&self) -> u32 {
        self.subscribe_count
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn last_client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn last_endpoint(&self) -> Option<(&str, u16)> {
        self.endpoint.as_ref().map(|(host, port)| (host.as_str(), *port))
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn published(&self) -> &[(String, Vec<u8>)] {
        &self.published
    }

    pub fn clear_published(&mut self) {
        self.published.clear();
    }

    /// Payloads published on `topic`, in order, as text
    pub fn payloads_on(&self, topic: &str) -> Vec<String> {
        self.published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }
}

impl BrokerClient for MemoryBroker {
    type Error = MockError;

    async fn connect(&mut self, host: &str, port: u16, client_id: &str) -> Result<(), Self::Error> {
        self.endpoint = Some((host.to_owned(), port));
        self.client_id = Some(client_id.to_owned());
        if self.refusals > 0 {
            self.refusals -= 1;
            return Err(MockError::Refused);
        }
        self.connected = true;
        self.subscriptions.clear();
        self.connects += 1;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockError::Offline);
        }
        if self.subscribe_rejections > 0 {
            self.subscribe_rejections -= 1;
            self.connected = false;
            return Err(MockError::Refused);
        }
        self.subscriptions.push(topic.to_owned());
        self.subscribe_count += 1;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockError::Offline);
        }
        self.published.push((topic.to_owned(), payload.to_vec()));
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<InboundMessage>, Self::Error> {
        if !self.connected {
            return Err(MockError::Offline);
        }
        self.polls += 1;
        Ok(self.inbound.pop_front())
    }
}
