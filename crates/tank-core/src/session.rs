//! MQTT broker session management
//!
//! [`SessionManager`] owns the logical session with the broker: whether it is
//! open, and the command-topic subscription that must exist whenever it is.
//! The wire protocol itself lives behind [`BrokerClient`], implemented by the
//! firmware on top of an MQTT client crate and by the simulator in memory.
//!
//! ```text
//! Disconnected --connect + subscribe ok--> Connected
//!      ^    |                                  |
//!      +----+ wait retry delay                 |
//!      +-------- transport reports loss -------+
//! ```
//!
//! Reconnection is a blocking loop: the node has one thread of control and
//! nothing else useful to do without a broker.

use core::fmt::Debug;

use embedded_hal_async::delay::DelayNs;
use log::{debug, info, warn};
use thiserror_no_std::Error;

use crate::config::BrokerConfig;

/// Longest topic accepted on an inbound message
pub const MAX_TOPIC_LEN: usize = 64;

/// Longest payload accepted on an inbound message
pub const MAX_INBOUND_PAYLOAD: usize = 128;

/// Upper bound on messages dispatched by one [`SessionManager::service`] call
pub const MAX_MESSAGES_PER_SERVICE: usize = 8;

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: heapless::String<MAX_TOPIC_LEN>,
    pub payload: heapless::Vec<u8, MAX_INBOUND_PAYLOAD>,
}

impl InboundMessage {
    /// Copy a received message into owned buffers. Returns `None` when the
    /// topic or payload does not fit.
    pub fn new(topic: &str, payload: &[u8]) -> Option<Self> {
        let mut owned_topic = heapless::String::new();
        owned_topic.push_str(topic).ok()?;
        let owned_payload = heapless::Vec::from_slice(payload).ok()?;
        Some(Self {
            topic: owned_topic,
            payload: owned_payload,
        })
    }
}

/// Transport-level MQTT client.
///
/// Implementations hold the broker address and socket; the session manager
/// only decides when to connect, subscribe, publish and poll.
#[allow(async_fn_in_trait)]
pub trait BrokerClient {
    type Error: Debug;

    /// Open a connection to `host:port` and perform the MQTT handshake.
    async fn connect(&mut self, host: &str, port: u16, client_id: &str)
    -> Result<(), Self::Error>;

    /// Whether the transport still considers the connection open.
    fn is_connected(&self) -> bool;

    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error>;

    /// Fire-and-forget publish (QoS 0, not retained).
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), Self::Error>;

    /// Keep the connection alive and return the next pending inbound message,
    /// or `None` when nothing is waiting.
    async fn poll(&mut self) -> Result<Option<InboundMessage>, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("Broker connection failed")]
    ConnectFailed,
    #[error("Subscription to the command topic failed")]
    SubscribeFailed,
    #[error("Publish was not accepted by the transport")]
    PublishFailed,
    #[error("Broker session is not connected")]
    NotConnected,
}

/// Counters kept for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Connection attempts, successful or not
    pub attempts: u32,
    /// Sessions established (connect and subscribe both succeeded)
    pub connects: u32,
    /// Inbound messages handed to the callback
    pub messages: u32,
}

pub struct SessionManager<'a> {
    broker: BrokerConfig<'a>,
    retry_delay_ms: u32,
    state: SessionState,
    stats: SessionStats,
}

impl<'a> SessionManager<'a> {
    pub const fn new(broker: BrokerConfig<'a>, retry_delay_ms: u32) -> Self {
        Self {
            broker,
            retry_delay_ms,
            state: SessionState::Disconnected,
            stats: SessionStats {
                attempts: 0,
                connects: 0,
                messages: 0,
            },
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn broker(&self) -> &BrokerConfig<'a> {
        &self.broker
    }

    /// Whether the session is open, after re-checking the transport.
    pub fn is_connected<B: BrokerClient>(&mut self, client: &B) -> bool {
        self.refresh(client);
        self.state == SessionState::Connected
    }

    /// Drop to `Disconnected` if the transport lost the connection.
    fn refresh<B: BrokerClient>(&mut self, client: &B) {
        if self.state == SessionState::Connected && !client.is_connected() {
            warn!("mqtt: session with {} lost", self.broker.host);
            self.state = SessionState::Disconnected;
        }
    }

    /// One connection attempt: connect, then (re)subscribe to the command topic.
    ///
    /// The session only counts as connected once the subscription is in
    /// place, so a failed subscribe is a failed attempt.
    pub async fn try_connect<B: BrokerClient>(&mut self, client: &mut B) -> Result<(), SessionError> {
        self.stats.attempts += 1;
        info!(
            "mqtt: connecting to broker {}:{} as '{}'",
            self.broker.host, self.broker.port, self.broker.client_id
        );

        client
            .connect(self.broker.host, self.broker.port, self.broker.client_id)
            .await
            .map_err(|e| {
                warn!("mqtt: broker connection failed: {:?}", e);
                SessionError::ConnectFailed
            })?;

        client
            .subscribe(self.broker.command_topic)
            .await
            .map_err(|e| {
                warn!(
                    "mqtt: subscribe to '{}' failed: {:?}",
                    self.broker.command_topic, e
                );
                SessionError::SubscribeFailed
            })?;

        self.state = SessionState::Connected;
        self.stats.connects += 1;
        info!(
            "mqtt: connected to broker, listening on '{}'",
            self.broker.command_topic
        );
        Ok(())
    }

    /// Block until a session with an active command subscription exists.
    ///
    /// Returns immediately if the session is already open. Otherwise retries
    /// with a fixed `retry_delay_ms` backoff and no upper bound on attempts.
    pub async fn ensure_session<B, D>(&mut self, client: &mut B, delay: &mut D)
    where
        B: BrokerClient,
        D: DelayNs,
    {
        self.refresh(client);

        while self.state != SessionState::Connected {
            if self.try_connect(client).await.is_err() {
                info!("mqtt: retrying in {} ms", self.retry_delay_ms);
                delay.delay_ms(self.retry_delay_ms).await;
            }
        }
    }

    /// Publish `payload` on `topic`, at most once.
    ///
    /// Nothing is queued or retried. A publish against a dead session is
    /// reported and otherwise dropped.
    pub async fn publish<B: BrokerClient>(
        &mut self,
        client: &mut B,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        self.refresh(client);
        if self.state != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }

        client.publish(topic, payload).await.map_err(|e| {
            warn!("mqtt: publish to '{}' failed: {:?}", topic, e);
            SessionError::PublishFailed
        })
    }

    /// Keep the session alive and dispatch pending inbound messages.
    ///
    /// Each message is handed to `on_message` as `(topic, payload)`. At most
    /// [`MAX_MESSAGES_PER_SERVICE`] messages are handled per call so one cycle
    /// cannot be stalled by a flood. Returns the number dispatched.
    pub async fn service<B, F>(&mut self, client: &mut B, mut on_message: F) -> usize
    where
        B: BrokerClient,
        F: FnMut(&str, &[u8]),
    {
        self.refresh(client);
        if self.state != SessionState::Connected {
            return 0;
        }

        let mut handled = 0;
        while handled < MAX_MESSAGES_PER_SERVICE {
            match client.poll().await {
                Ok(Some(message)) => {
                    debug!(
                        "mqtt: message on '{}' ({} bytes)",
                        message.topic.as_str(),
                        message.payload.len()
                    );
                    on_message(message.topic.as_str(), &message.payload);
                    handled += 1;
                    self.stats.messages += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("mqtt: keep-alive failed: {:?}", e);
                    self.refresh(client);
                    break;
                }
            }
        }

        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemoryBroker, VirtualDelay};
    use embassy_futures::block_on;

    fn manager() -> SessionManager<'static> {
        SessionManager::new(BrokerConfig::default(), 2000)
    }

    #[test]
    fn test_connect_subscribes_to_command_topic() {
        let mut broker = MemoryBroker::new();
        let mut delay = VirtualDelay::new();
        let mut session = manager();

        block_on(session.ensure_session(&mut broker, &mut delay));

        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(broker.connects(), 1);
        assert_eq!(broker.last_client_id(), Some("TANQUE"));
        assert_eq!(broker.last_endpoint(), Some(("broker.hivemq.com", 1883)));
        assert_eq!(broker.subscriptions(), ["MQTT_TANK_IN"]);
        assert_eq!(delay.calls(), 0);
    }

    #[test]
    fn test_retries_with_fixed_backoff() {
        let mut broker = MemoryBroker::new();
        broker.refuse_connections(3);
        let mut delay = VirtualDelay::new();
        let mut session = manager();

        block_on(session.ensure_session(&mut broker, &mut delay));

        assert!(session.is_connected(&broker));
        assert_eq!(session.stats().attempts, 4);
        assert_eq!(session.stats().connects, 1);
        assert_eq!(delay.calls(), 3);
        assert_eq!(delay.elapsed_ms(), 6000);
    }

    #[test]
    fn test_failed_subscribe_counts_as_failed_attempt() {
        let mut broker = MemoryBroker::new();
        broker.reject_subscriptions(1);
        let mut delay = VirtualDelay::new();
        let mut session = manager();

        block_on(session.ensure_session(&mut broker, &mut delay));

        assert!(session.is_connected(&broker));
        assert_eq!(session.stats().attempts, 2);
        assert_eq!(broker.subscriptions(), ["MQTT_TANK_IN"]);
        assert_eq!(delay.elapsed_ms(), 2000);
    }

    #[test]
    fn test_resubscribes_after_reconnect() {
        let mut broker = MemoryBroker::new();
        let mut delay = VirtualDelay::new();
        let mut session = manager();
        block_on(session.ensure_session(&mut broker, &mut delay));

        broker.drop_connection();
        assert!(!session.is_connected(&broker));
        block_on(session.ensure_session(&mut broker, &mut delay));

        assert_eq!(broker.connects(), 2);
        assert_eq!(broker.subscriptions(), ["MQTT_TANK_IN"]);
        assert_eq!(broker.subscribe_count(), 2);
    }

    #[test]
    fn test_ensure_session_when_connected_is_noop() {
        let mut broker = MemoryBroker::new();
        let mut delay = VirtualDelay::new();
        let mut session = manager();
        block_on(session.ensure_session(&mut broker, &mut delay));

        block_on(session.ensure_session(&mut broker, &mut delay));

        assert_eq!(broker.connects(), 1);
        assert_eq!(broker.subscribe_count(), 1);
    }

    #[test]
    fn test_publish_requires_session() {
        let mut broker = MemoryBroker::new();
        let mut session = manager();

        let result = block_on(session.publish(&mut broker, "TANQUE_RENASCENCA", b"888 mbar"));

        assert_eq!(result, Err(SessionError::NotConnected));
        assert!(broker.published().is_empty());
    }

    #[test]
    fn test_publish_on_open_session() {
        let mut broker = MemoryBroker::new();
        let mut delay = VirtualDelay::new();
        let mut session = manager();
        block_on(session.ensure_session(&mut broker, &mut delay));

        let result = block_on(session.publish(&mut broker, "TANQUE_RENASCENCA", b"888 mbar"));

        assert_eq!(result, Ok(()));
        assert_eq!(broker.payloads_on("TANQUE_RENASCENCA"), ["888 mbar"]);
    }

    #[test]
    fn test_service_dispatches_inbound_messages() {
        let mut broker = MemoryBroker::new();
        let mut delay = VirtualDelay::new();
        let mut session = manager();
        block_on(session.ensure_session(&mut broker, &mut delay));
        broker.inject("MQTT_TANK_IN", b"L");
        broker.inject("MQTT_TANK_IN", b"D");

        let mut seen = Vec::new();
        let handled = block_on(session.service(&mut broker, |topic, payload| {
            seen.push((topic.to_owned(), payload.to_vec()));
        }));

        assert_eq!(handled, 2);
        assert_eq!(seen[0], ("MQTT_TANK_IN".to_owned(), b"L".to_vec()));
        assert_eq!(seen[1], ("MQTT_TANK_IN".to_owned(), b"D".to_vec()));
        assert_eq!(broker.polls(), 3);
    }

    #[test]
    fn test_service_is_bounded_per_call() {
        let mut broker = MemoryBroker::new();
        let mut delay = VirtualDelay::new();
        let mut session = manager();
        block_on(session.ensure_session(&mut broker, &mut delay));
        for _ in 0..MAX_MESSAGES_PER_SERVICE + 2 {
            broker.inject("MQTT_TANK_IN", b"L");
        }

        let first = block_on(session.service(&mut broker, |_, _| {}));
        let second = block_on(session.service(&mut broker, |_, _| {}));

        assert_eq!(first, MAX_MESSAGES_PER_SERVICE);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_service_without_session_does_nothing() {
        let mut broker = MemoryBroker::new();
        broker.inject("MQTT_TANK_IN", b"L");
        let mut session = manager();

        let handled = block_on(session.service(&mut broker, |_, _| {}));

        assert_eq!(handled, 0);
        assert_eq!(broker.polls(), 0);
    }

    #[test]
    fn test_inbound_message_rejects_oversized_payload() {
        assert!(InboundMessage::new("MQTT_TANK_IN", &[b'x'; MAX_INBOUND_PAYLOAD + 1]).is_none());
        assert!(InboundMessage::new("MQTT_TANK_IN", b"L").is_some());
    }
}
