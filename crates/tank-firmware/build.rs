//! Forwards node settings from `.env` (or the build environment) to the
//! compiler, so `env!`/`option_env!` in the firmware can see them.

const FORWARDED: [&str; 6] = [
    "WIFI_SSID",
    "WIFI_PASSWORD",
    "MQTT_BROKER_HOST",
    "MQTT_BROKER_PORT",
    "MQTT_CLIENT_ID",
    "TANK_PAYLOAD_FORMAT",
];

fn main() {
    // A missing .env is fine; the variables may come from the shell.
    if let Ok(path) = dotenvy::dotenv() {
        println!("cargo:rerun-if-changed={}", path.display());
    }

    for name in FORWARDED {
        println!("cargo:rerun-if-env-changed={name}");
        if let Ok(value) = std::env::var(name) {
            println!("cargo:rustc-env={name}={value}");
        }
    }
}
