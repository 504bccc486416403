// Host builds only compile the testable modules
#![cfg_attr(not(target_os = "espidf"), allow(dead_code))]

mod config;
mod logging;
mod network;
mod ota;
mod version;

#[cfg(target_os = "espidf")]
mod heartbeat;

#[cfg(target_os = "espidf")]
use esp_idf_sys as _; // Binstart

// Generate ESP-IDF app descriptor
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};
    use log::{info, LevelFilter};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::network::NetworkManager;
    use crate::ota::{EspOtaFlash, OtaWebServer};

    // Initialize ESP-IDF
    esp_idf_svc::sys::link_patches();

    // Initialize our logger with colors and timestamps
    logging::init_logger(LevelFilter::Info).map_err(|e| anyhow::anyhow!("Failed to initialize logger: {e}"))?;
    info!("ESP32 Web OTA {}", version::full_version());

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let config = config::load_or_default(&nvs)?;
    if !logging::set_max_level_from_str(&config.log_level) {
        log::warn!("Unknown log level '{}', keeping info", config.log_level);
    }

    let flash = EspOtaFlash::new();
    info!("Running from {}", flash.running_label().unwrap_or_else(|| "unknown".to_string()));

    if let Err(e) = heartbeat::start(config.led_gpio, Duration::from_millis(1000)) {
        log::warn!("Heartbeat LED unavailable: {:?}", e);
    }

    let mut network = NetworkManager::new(peripherals.modem, sys_loop, nvs.clone(), &config)?;
    network.connect(&config.hostname, config.http_port)?;

    let _server = OtaWebServer::new(config.http_port, Arc::new(Mutex::new(flash)), config.update.clone())?;

    // A freshly updated image is only kept once it can accept the next update
    EspOtaFlash::new().confirm_running_image();
    info!(
        "Ready: http://{}.local (http://{}:{})",
        config.hostname,
        network.get_ip().unwrap_or_default(),
        config.http_port
    );

    // Server and heartbeat run on their own tasks
    loop {
        FreeRtos::delay_ms(1000);
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    println!(
        "esp32-ota-web {} targets ESP-IDF; build with an espidf target to flash it",
        version::full_version()
    );
}
