#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use embassy_executor::Spawner;
use embassy_time::{Delay, Instant};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::timer::timg::TimerGroup;
use log::{error, info};
use tank_core::config::{DEFAULT_BROKER_HOST, DEFAULT_BROKER_PORT, DEFAULT_CLIENT_ID};
use tank_core::{BrokerConfig, Controller, NodeConfig, PayloadFormat, WifiConfig};
use tank_firmware::mqtt::RustMqttBroker;
use tank_firmware::sensor::PressureChannel;
use tank_firmware::wifi::init_network;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

/// Node settings baked in at build time (see `.env.example`)
fn node_config() -> NodeConfig<'static> {
    let port = option_env!("MQTT_BROKER_PORT")
        .and_then(|port| port.parse().ok())
        .unwrap_or(DEFAULT_BROKER_PORT);
    let payload_format = option_env!("TANK_PAYLOAD_FORMAT")
        .and_then(PayloadFormat::from_name)
        .unwrap_or_default();

    NodeConfig {
        wifi: WifiConfig {
            ssid: option_env!("WIFI_SSID").unwrap_or(""),
            password: option_env!("WIFI_PASSWORD").unwrap_or(""),
        },
        broker: BrokerConfig {
            host: option_env!("MQTT_BROKER_HOST").unwrap_or(DEFAULT_BROKER_HOST),
            port,
            client_id: option_env!("MQTT_CLIENT_ID").unwrap_or(DEFAULT_CLIENT_ID),
            ..BrokerConfig::default()
        },
        payload_format,
        ..NodeConfig::default()
    }
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("Embassy initialized!");

    let node_config = node_config();
    if let Err(e) = node_config.validate() {
        error!("config: {}", e);
        panic!("invalid node configuration: {}", e);
    }

    // Relay input is active low; start released.
    let actuator = Output::new(peripherals.GPIO5, Level::High, OutputConfig::default());
    let channel = PressureChannel::new(peripherals.ADC1, peripherals.GPIO4);

    let radio_init = alloc::boxed::Box::leak(alloc::boxed::Box::new(
        esp_radio::init().expect("Failed to initialize Wi-Fi/BLE controller"),
    ));
    let (wifi_controller, interfaces) =
        esp_radio::wifi::new(radio_init, peripherals.WIFI, Default::default())
            .expect("Failed to initialize Wi-Fi controller");

    let seed = Instant::now().as_ticks();
    let (network, stack) = init_network(spawner, wifi_controller, interfaces.sta, seed);
    let broker = RustMqttBroker::new(stack, node_config.broker.client_id);

    let mut node = Controller::new(node_config, channel, actuator, network, broker, Delay);
    node.run().await
}
