//! Wi-Fi station interface and the embassy-net stack on top of it
//!
//! The controller is shared between [`EspWifi`] and a watchdog task. The
//! watchdog re-issues the association request whenever the driver reports
//! the link down, so the link comes back on its own while the control loop
//! is busy retrying the broker.

use core::net::Ipv4Addr;

use alloc::string::ToString;
use embassy_executor::Spawner;
use embassy_net::{Config as NetConfig, Runner, Stack, StackResources};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Timer};
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController, WifiDevice, WifiError};
use log::{error, info, warn};
use static_cell::StaticCell;
use tank_core::NetworkInterface;

/// Sockets held by the stack: DHCP, DNS and the broker connection
const STACK_SOCKETS: usize = 3;

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

pub type SharedController = Mutex<CriticalSectionRawMutex, WifiController<'static>>;

/// Station-mode interface. The link only counts as up once DHCP has
/// configured an address, since nothing useful can happen before that.
pub struct EspWifi {
    controller: &'static SharedController,
    stack: Stack<'static>,
}

impl EspWifi {
    pub fn new(controller: &'static SharedController, stack: Stack<'static>) -> Self {
        Self { controller, stack }
    }
}

impl NetworkInterface for EspWifi {
    type Error = WifiError;

    async fn begin(&mut self, ssid: &str, password: &str) -> Result<(), Self::Error> {
        let client = ClientConfig::default()
            .with_ssid(ssid.to_string())
            .with_password(password.to_string());

        let mut controller = self.controller.lock().await;
        controller.set_config(&ModeConfig::Client(client))?;

        if !controller.is_started()? {
            controller.start()?;
            info!("wifi: started STA mode");
        }

        controller.connect()
    }

    async fn is_connected(&mut self) -> bool {
        let associated = self
            .controller
            .lock()
            .await
            .is_connected()
            .unwrap_or(false);
        associated && self.stack.is_config_up()
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.stack.config_v4().map(|config| config.address.address())
    }
}

/// Processes packets, DHCP and DNS for the stack. Must run for the lifetime
/// of the firmware.
#[embassy_executor::task]
async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) {
    runner.run().await
}

#[embassy_executor::task]
async fn watchdog_task(controller: &'static SharedController) {
    loop {
        Timer::after(WATCHDOG_INTERVAL).await;

        let mut controller = controller.lock().await;
        let started = controller.is_started().unwrap_or(false);
        if started && !controller.is_connected().unwrap_or(true) {
            warn!("wifi: driver reports link down, reassociating");
            if let Err(e) = controller.connect() {
                warn!("wifi: reassociation request failed: {:?}", e);
            }
        }
    }
}

/// Bring up embassy-net with DHCP on the station device and spawn its runner
/// and the link watchdog.
///
/// # Panics
/// If called more than once.
pub fn init_network(
    spawner: Spawner,
    controller: WifiController<'static>,
    device: WifiDevice<'static>,
    seed: u64,
) -> (EspWifi, Stack<'static>) {
    static RESOURCES: StaticCell<StackResources<STACK_SOCKETS>> = StaticCell::new();
    static CONTROLLER: StaticCell<SharedController> = StaticCell::new();

    let (stack, runner) = embassy_net::new(
        device,
        NetConfig::dhcpv4(Default::default()),
        RESOURCES.init(StackResources::new()),
        seed,
    );
    let controller: &'static SharedController = CONTROLLER.init(Mutex::new(controller));

    if let Err(e) = spawner.spawn(net_task(runner)) {
        error!("network: failed to spawn stack runner: {:?}", e);
    }
    if let Err(e) = spawner.spawn(watchdog_task(controller)) {
        error!("wifi: failed to spawn link watchdog: {:?}", e);
    }
    info!("network: embassy-net stack initialized with DHCP");

    (EspWifi::new(controller, stack), stack)
}
