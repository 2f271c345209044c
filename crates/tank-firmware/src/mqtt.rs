//! MQTT v5 client over embassy-net, implementing [`BrokerClient`]
//!
//! rust-mqtt's client borrows its packet buffers for its whole life, so one
//! client is built at boot and reused. Reconnecting reopens the TCP socket
//! underneath it and repeats the CONNECT handshake.

use core::cell::RefCell;
use core::net::Ipv4Addr;

use embassy_net::dns::{self, DnsQueryType};
use embassy_net::tcp::{ConnectError, TcpSocket};
use embassy_net::{IpAddress, Stack};
use embassy_time::{Duration, Instant, with_timeout};
use embedded_io_async::{ErrorType, Read, Write};
use log::{debug, info, warn};
use rust_mqtt::client::client::MqttClient;
use rust_mqtt::client::client_config::{ClientConfig, MqttVersion};
use rust_mqtt::packet::v5::publish_packet::QualityOfService;
use rust_mqtt::packet::v5::reason_codes::ReasonCode;
use rust_mqtt::utils::rng_generator::CountingRng;
use static_cell::StaticCell;
use tank_core::{BrokerClient, InboundMessage};
use thiserror_no_std::Error;

const TCP_BUFFER_SIZE: usize = 2048;
const MQTT_BUFFER_SIZE: usize = 1024;
const MAX_PROPERTIES: usize = 5;

const KEEP_ALIVE_SECS: u16 = 15;
/// Ping well inside the keep-alive window
const PING_INTERVAL: Duration = Duration::from_secs(KEEP_ALIVE_SECS as u64 / 2);
/// Inactivity limit on the TCP socket, which also bounds a stalled packet read
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
/// How long one poll waits for inbound data before reporting none
const RECEIVE_WINDOW: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum MqttError {
    #[error("DNS lookup failed: {0:?}")]
    Dns(dns::Error),
    #[error("Broker host resolved to no address")]
    NoAddress,
    #[error("TCP connection failed: {0:?}")]
    Tcp(ConnectError),
    #[error("Broker returned {0:?}")]
    Broker(ReasonCode),
    #[error("Not connected to the broker")]
    NotConnected,
}

/// Handle to the one TCP socket, shared between the MQTT client (which
/// reads and writes through it) and the adapter (which reconnects it).
pub struct SharedSocket(&'static RefCell<TcpSocket<'static>>);

impl ErrorType for SharedSocket {
    type Error = embassy_net::tcp::Error;
}

#[allow(
    clippy::await_holding_refcell_ref,
    reason = "only the broker task touches the socket and it never reconnects mid-transfer"
)]
impl Read for SharedSocket {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.0.borrow_mut().read(buf).await
    }
}

#[allow(
    clippy::await_holding_refcell_ref,
    reason = "only the broker task touches the socket and it never reconnects mid-transfer"
)]
impl Write for SharedSocket {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.borrow_mut().write(buf).await
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().flush().await
    }
}

pub struct RustMqttBroker {
    stack: Stack<'static>,
    socket: &'static RefCell<TcpSocket<'static>>,
    client: MqttClient<'static, SharedSocket, MAX_PROPERTIES, CountingRng>,
    client_id: &'static str,
    connected: bool,
    last_activity: Instant,
}

impl RustMqttBroker {
    /// The client id is fixed here; rust-mqtt keeps it in the client config.
    ///
    /// # Panics
    /// If called more than once.
    pub fn new(stack: Stack<'static>, client_id: &'static str) -> Self {
        static TCP_RX: StaticCell<[u8; TCP_BUFFER_SIZE]> = StaticCell::new();
        static TCP_TX: StaticCell<[u8; TCP_BUFFER_SIZE]> = StaticCell::new();
        static SOCKET: StaticCell<RefCell<TcpSocket<'static>>> = StaticCell::new();
        static MQTT_RX: StaticCell<[u8; MQTT_BUFFER_SIZE]> = StaticCell::new();
        static MQTT_TX: StaticCell<[u8; MQTT_BUFFER_SIZE]> = StaticCell::new();

        let mut socket = TcpSocket::new(
            stack,
            TCP_RX.init([0; TCP_BUFFER_SIZE]),
            TCP_TX.init([0; TCP_BUFFER_SIZE]),
        );
        socket.set_timeout(Some(SOCKET_TIMEOUT));
        let socket = SOCKET.init(RefCell::new(socket));

        let mut config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(0));
        config.add_client_id(client_id);
        config.keep_alive = KEEP_ALIVE_SECS;
        config.max_packet_size = MQTT_BUFFER_SIZE as u32;

        let client = MqttClient::<_, MAX_PROPERTIES, _>::new(
            SharedSocket(socket),
            MQTT_TX.init([0; MQTT_BUFFER_SIZE]),
            MQTT_BUFFER_SIZE,
            MQTT_RX.init([0; MQTT_BUFFER_SIZE]),
            MQTT_BUFFER_SIZE,
            config,
        );

        Self {
            stack,
            socket,
            client,
            client_id,
            connected: false,
            last_activity: Instant::now(),
        }
    }

    async fn resolve(&self, host: &str) -> Result<IpAddress, MqttError> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(IpAddress::Ipv4(ip));
        }

        let addresses = self
            .stack
            .dns_query(host, DnsQueryType::A)
            .await
            .map_err(MqttError::Dns)?;
        let address = addresses.first().copied().ok_or(MqttError::NoAddress)?;
        debug!("mqtt: resolved '{}' to {}", host, address);
        Ok(address)
    }

    /// Drop the session after a protocol error so the next check reconnects.
    fn fail(&mut self, code: ReasonCode) -> MqttError {
        warn!("mqtt: connection closed after {:?}", code);
        self.connected = false;
        MqttError::Broker(code)
    }
}

impl BrokerClient for RustMqttBroker {
    type Error = MqttError;

    #[allow(
        clippy::await_holding_refcell_ref,
        reason = "the client is idle while the socket reconnects"
    )]
    async fn connect(&mut self, host: &str, port: u16, client_id: &str) -> Result<(), Self::Error> {
        if client_id != self.client_id {
            warn!(
                "mqtt: client id is fixed at '{}', ignoring '{}'",
                self.client_id, client_id
            );
        }

        self.connected = false;
        self.socket.borrow_mut().abort();

        let address = self.resolve(host).await?;
        info!("mqtt: connecting TCP to {}:{}", address, port);
        self.socket
            .borrow_mut()
            .connect((address, port))
            .await
            .map_err(MqttError::Tcp)?;

        if let Err(code) = self.client.connect_to_broker().await {
            self.socket.borrow_mut().abort();
            return Err(MqttError::Broker(code));
        }

        self.connected = true;
        self.last_activity = Instant::now();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected && self.socket.borrow().may_send()
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MqttError::NotConnected);
        }
        match self.client.subscribe_to_topic(topic).await {
            Ok(()) => {
                self.last_activity = Instant::now();
                Ok(())
            }
            Err(code) => Err(self.fail(code)),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MqttError::NotConnected);
        }
        match self
            .client
            .send_message(topic, payload, QualityOfService::QoS0, false)
            .await
        {
            Ok(()) => {
                self.last_activity = Instant::now();
                Ok(())
            }
            Err(code) => Err(self.fail(code)),
        }
    }

    /// Sends a ping when the connection has been idle for half the
    /// keep-alive, then waits up to [`RECEIVE_WINDOW`] for inbound data.
    ///
    /// Only the wait for readability is bounded. Once bytes are available the
    /// whole packet is read, so a cancelled read can never leave a partial
    /// packet in the socket. A peer that stalls mid-packet trips the socket
    /// timeout and the session is rebuilt.
    #[allow(
        clippy::await_holding_refcell_ref,
        reason = "the shared borrow only waits for readiness and the client is idle"
    )]
    async fn poll(&mut self) -> Result<Option<InboundMessage>, Self::Error> {
        if !self.connected {
            return Err(MqttError::NotConnected);
        }

        if self.last_activity.elapsed() >= PING_INTERVAL {
            if let Err(code) = self.client.send_ping().await {
                return Err(self.fail(code));
            }
            self.last_activity = Instant::now();
        }

        let readable = {
            let socket = self.socket.borrow();
            with_timeout(RECEIVE_WINDOW, socket.wait_read_ready())
                .await
                .is_ok()
        };
        if !readable {
            return Ok(None);
        }

        let received = match self.client.receive_message().await {
            Err(code) => return Err(self.fail(code)),
            Ok((topic, payload)) => {
                let message = InboundMessage::new(topic, payload);
                if message.is_none() {
                    warn!(
                        "mqtt: dropping oversized message on '{}' ({} bytes)",
                        topic,
                        payload.len()
                    );
                }
                message
            }
        };

        self.last_activity = Instant::now();
        Ok(received)
    }
}
