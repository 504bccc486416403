pub mod compression;

#[cfg(target_os = "espidf")]
pub mod wifi;

#[cfg(target_os = "espidf")]
pub use self::esp::NetworkManager;

#[cfg(target_os = "espidf")]
mod esp {
    use anyhow::Result;
    use esp_idf_hal::modem::Modem;
    use esp_idf_svc::{eventloop::EspSystemEventLoop, mdns::EspMdns, nvs::EspDefaultNvsPartition};

    use super::wifi::WifiManager;
    use crate::config::Config;

    pub struct NetworkManager {
        wifi: WifiManager,
        _mdns: Option<EspMdns>,
    }

    impl NetworkManager {
        pub fn new(
            modem: Modem,
            sys_loop: EspSystemEventLoop,
            nvs: EspDefaultNvsPartition,
            config: &Config,
        ) -> Result<Self> {
            let wifi = WifiManager::new(
                modem,
                sys_loop,
                nvs,
                config.wifi_ssid.clone(),
                config.wifi_password.clone(),
            )?;

            Ok(Self { wifi, _mdns: None })
        }

        pub fn connect(&mut self, hostname: &str, http_port: u16) -> Result<()> {
            self.wifi.connect()?;
            log::info!("Connected to {}", self.wifi.ssid);
            log::info!("IP address: {}", self.get_ip().unwrap_or_default());

            // mDNS failure leaves the device reachable by IP
            match self.start_mdns(hostname, http_port) {
                Ok(_) => log::info!("mDNS responder started: http://{hostname}.local"),
                Err(e) => log::warn!("Failed to start mDNS: {:?}", e),
            }

            Ok(())
        }

        fn start_mdns(&mut self, hostname: &str, http_port: u16) -> Result<()> {
            let mut mdns = EspMdns::take()?;
            mdns.set_hostname(hostname)?;
            mdns.add_service(None, "_http", "_tcp", http_port, &[("path", "/")])?;

            self._mdns = Some(mdns);
            Ok(())
        }

        pub fn get_ip(&self) -> Option<String> {
            self.wifi.get_ip()
        }
    }
}
