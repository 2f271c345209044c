//! Wi-Fi link management
//!
//! The node has exactly one network and nobody on site to fix it, so the link
//! manager never gives up: [`LinkManager::ensure_connected`] blocks until the
//! access point accepts the association. The blocking loop is built out of
//! [`LinkManager::poll`], a single step of the state machine, which is what
//! tests drive directly.
//!
//! ```text
//! Disconnected --begin--> Connecting --status ok--> Connected
//!      ^                                               |
//!      +------------------- link lost -----------------+
//! ```

use core::fmt::Debug;
use core::net::Ipv4Addr;

use embedded_hal_async::delay::DelayNs;
use log::{debug, info, warn};

use crate::config::WifiConfig;

/// Station-mode network interface
#[allow(async_fn_in_trait)]
pub trait NetworkInterface {
    type Error: Debug;

    /// Start associating with the access point. Returns once the request is
    /// issued, not once the link is up.
    async fn begin(&mut self, ssid: &str, password: &str) -> Result<(), Self::Error>;

    /// Current association status, as reported by the driver.
    async fn is_connected(&mut self) -> bool;

    /// Address obtained from DHCP, if any yet.
    fn local_address(&self) -> Option<Ipv4Addr>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Counters kept for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Association requests issued
    pub attempts: u32,
    /// Transitions into [`LinkState::Connected`]
    pub connects: u32,
    /// Status polls performed while connecting
    pub polls: u32,
}

pub struct LinkManager<'a> {
    wifi: WifiConfig<'a>,
    poll_interval_ms: u32,
    state: LinkState,
    stats: LinkStats,
}

impl<'a> LinkManager<'a> {
    pub const fn new(wifi: WifiConfig<'a>, poll_interval_ms: u32) -> Self {
        Self {
            wifi,
            poll_interval_ms,
            state: LinkState::Disconnected,
            stats: LinkStats {
                attempts: 0,
                connects: 0,
                polls: 0,
            },
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Advance the state machine by one step.
    ///
    /// - `Disconnected`: issue the association request, then check status once.
    /// - `Connecting`: check status.
    /// - `Connected`: check status, dropping back to `Disconnected` on loss.
    ///
    /// A failed association request leaves the state at `Disconnected` so the
    /// next step issues it again.
    pub async fn poll<N: NetworkInterface>(&mut self, net: &mut N) -> LinkState {
        if self.state == LinkState::Disconnected {
            self.stats.attempts += 1;
            info!("wifi: connecting to network '{}'", self.wifi.ssid);
            if let Err(e) = net.begin(self.wifi.ssid, self.wifi.password).await {
                warn!("wifi: association request failed: {:?}", e);
                return self.state;
            }
            self.state = LinkState::Connecting;
        }

        let up = net.is_connected().await;
        match self.state {
            LinkState::Connecting if up => self.on_connected(net),
            LinkState::Connecting => {
                self.stats.polls += 1;
                debug!("wifi: waiting for association (poll {})", self.stats.polls);
            }
            LinkState::Connected if !up => {
                warn!("wifi: link to '{}' lost", self.wifi.ssid);
                self.state = LinkState::Disconnected;
            }
            _ => {}
        }

        self.state
    }

    /// Sync the state with the interface's status without associating.
    ///
    /// A lost link drops to `Disconnected`; a link the driver brought back on
    /// its own is adopted as `Connected`. Returns whether the link is up.
    pub async fn refresh<N: NetworkInterface>(&mut self, net: &mut N) -> bool {
        if net.is_connected().await {
            if self.state != LinkState::Connected {
                self.on_connected(net);
            }
            return true;
        }

        if self.state == LinkState::Connected {
            warn!("wifi: link to '{}' lost", self.wifi.ssid);
            self.state = LinkState::Disconnected;
        }
        false
    }

    /// Make sure the link is up, blocking until it is.
    ///
    /// Returns immediately when the interface already reports a connection.
    /// Otherwise associates and polls every `poll_interval_ms` with no upper
    /// bound on attempts.
    pub async fn ensure_connected<N, D>(&mut self, net: &mut N, delay: &mut D)
    where
        N: NetworkInterface,
        D: DelayNs,
    {
        if self.refresh(net).await {
            return;
        }

        while self.poll(net).await != LinkState::Connected {
            delay.delay_ms(self.poll_interval_ms).await;
        }
    }

    fn on_connected<N: NetworkInterface>(&mut self, net: &N) {
        self.state = LinkState::Connected;
        self.stats.connects += 1;
        self.stats.polls = 0;

        match net.local_address() {
            Some(addr) => info!("wifi: connected to '{}', address {}", self.wifi.ssid, addr),
            None => info!("wifi: connected to '{}'", self.wifi.ssid),
        }
        if self.stats.connects > 1 {
            info!("wifi: reconnected ({} connects so far)", self.stats.connects);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedNetwork, VirtualDelay};
    use embassy_futures::block_on;

    const WIFI: WifiConfig<'static> = WifiConfig {
        ssid: "tank-ap",
        password: "secret",
    };

    #[test]
    fn test_connects_after_polling() {
        let mut net = ScriptedNetwork::new(3);
        let mut delay = VirtualDelay::new();
        let mut link = LinkManager::new(WIFI, 100);

        block_on(link.ensure_connected(&mut net, &mut delay));

        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(net.begins(), 1);
        assert_eq!(net.last_ssid(), Some("tank-ap"));
        // three failed status checks, each followed by one poll interval
        assert_eq!(delay.elapsed_ms(), 300);
        assert_eq!(link.stats().connects, 1);
    }

    #[test]
    fn test_immediate_association_needs_no_delay() {
        let mut net = ScriptedNetwork::new(0);
        let mut delay = VirtualDelay::new();
        let mut link = LinkManager::new(WIFI, 100);

        block_on(link.ensure_connected(&mut net, &mut delay));

        assert!(link.is_connected());
        assert_eq!(delay.calls(), 0);
    }

    #[test]
    fn test_already_connected_is_noop() {
        let mut net = ScriptedNetwork::new(0);
        let mut delay = VirtualDelay::new();
        let mut link = LinkManager::new(WIFI, 100);
        block_on(link.ensure_connected(&mut net, &mut delay));

        block_on(link.ensure_connected(&mut net, &mut delay));
        block_on(link.ensure_connected(&mut net, &mut delay));

        assert_eq!(net.begins(), 1);
        assert_eq!(link.stats().connects, 1);
        assert_eq!(delay.calls(), 0);
    }

    #[test]
    fn test_reconnects_after_loss() {
        let mut net = ScriptedNetwork::new(0);
        let mut delay = VirtualDelay::new();
        let mut link = LinkManager::new(WIFI, 100);
        block_on(link.ensure_connected(&mut net, &mut delay));

        net.drop_link(2);
        block_on(link.ensure_connected(&mut net, &mut delay));

        assert!(link.is_connected());
        assert_eq!(net.begins(), 2);
        assert_eq!(link.stats().connects, 2);
        assert_eq!(delay.elapsed_ms(), 200);
    }

    #[test]
    fn test_poll_steps_through_states() {
        let mut net = ScriptedNetwork::new(1);
        let mut link = LinkManager::new(WIFI, 100);
        assert_eq!(link.state(), LinkState::Disconnected);

        assert_eq!(block_on(link.poll(&mut net)), LinkState::Connecting);
        assert_eq!(block_on(link.poll(&mut net)), LinkState::Connected);

        net.drop_link(5);
        assert_eq!(block_on(link.poll(&mut net)), LinkState::Disconnected);
    }

    #[test]
    fn test_failed_begin_is_retried() {
        let mut net = ScriptedNetwork::new(0);
        net.fail_begins(2);
        let mut delay = VirtualDelay::new();
        let mut link = LinkManager::new(WIFI, 100);

        block_on(link.ensure_connected(&mut net, &mut delay));

        assert!(link.is_connected());
        assert_eq!(link.stats().attempts, 3);
        assert_eq!(delay.elapsed_ms(), 200);
    }

    #[test]
    fn test_refresh_reports_loss_without_associating() {
        let mut net = ScriptedNetwork::new(0);
        let mut delay = VirtualDelay::new();
        let mut link = LinkManager::new(WIFI, 100);
        block_on(link.ensure_connected(&mut net, &mut delay));
        assert!(block_on(link.refresh(&mut net)));

        net.drop_link(0);

        assert!(!block_on(link.refresh(&mut net)));
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(net.begins(), 1);
    }

    #[test]
    fn test_adopts_link_brought_up_elsewhere() {
        let mut net = ScriptedNetwork::connected();
        let mut delay = VirtualDelay::new();
        let mut link = LinkManager::new(WIFI, 100);

        block_on(link.ensure_connected(&mut net, &mut delay));

        assert!(link.is_connected());
        assert_eq!(net.begins(), 0);
    }
}
