use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use update_core::UpdateConfig;

#[cfg(target_os = "espidf")]
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};

#[cfg(target_os = "espidf")]
const CONFIG_NAMESPACE: &str = "ota_web";
#[cfg(target_os = "espidf")]
const CONFIG_KEY: &str = "config";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    // WiFi settings
    pub wifi_ssid: String,
    pub wifi_password: String,

    // Network identity, reachable as http://<hostname>.local
    pub hostname: String,
    pub http_port: u16,

    // Status LED toggled once per second while the server runs
    pub led_gpio: u8,
    pub log_level: String,

    // OTA settings
    pub update: UpdateConfig,
}

impl Default for Config {
    fn default() -> Self {
        // Get WiFi credentials from environment variables set by build.rs
        // These come from wifi_config.h which should NOT be committed to git
        let wifi_ssid = env!("WIFI_SSID");
        let wifi_password = env!("WIFI_PASSWORD");

        Self {
            wifi_ssid: wifi_ssid.to_string(),
            wifi_password: wifi_password.to_string(),
            hostname: "esp32".to_string(),
            http_port: 80,
            led_gpio: 2,
            log_level: "info".to_string(),
            update: UpdateConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() || !self.hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            bail!("invalid mDNS host name '{}'", self.hostname);
        }
        if self.http_port == 0 {
            bail!("HTTP port must not be 0");
        }
        if crate::logging::parse_level(&self.log_level).is_none() {
            bail!("unknown log level '{}'", self.log_level);
        }
        self.update.validate()?;
        Ok(())
    }

    /// Fill empty WiFi credentials from the compiled-in defaults.
    /// Returns true if anything changed.
    pub fn apply_compiled_credentials(&mut self) -> bool {
        if !self.wifi_ssid.is_empty() && !self.wifi_password.is_empty() {
            return false;
        }
        let defaults = Config::default();
        if defaults.wifi_ssid.is_empty() {
            return false;
        }
        log::warn!("NVS WiFi credentials empty, using compiled defaults: SSID='{}'", defaults.wifi_ssid);
        self.wifi_ssid = defaults.wifi_ssid;
        self.wifi_password = defaults.wifi_password;
        true
    }
}

#[cfg(target_os = "espidf")]
impl Config {
    pub fn save(&self, nvs: &EspDefaultNvsPartition) -> Result<()> {
        save_to_nvs(nvs, self)?;
        log::info!("Configuration saved to NVS");
        Ok(())
    }
}

#[cfg(target_os = "espidf")]
pub fn load_or_default(nvs: &EspDefaultNvsPartition) -> Result<Config> {
    match load_from_nvs(nvs) {
        Ok(mut config) => {
            log::info!("Loaded configuration from NVS");

            if config.apply_compiled_credentials() {
                if let Err(e) = config.save(nvs) {
                    log::warn!("Failed to save updated config with WiFi credentials: {:?}", e);
                }
            }

            if let Err(e) = config.validate() {
                log::warn!("Stored configuration rejected ({e}), using defaults");
                return Ok(Config::default());
            }
            Ok(config)
        }
        Err(e) => {
            log::warn!("Failed to load config from NVS: {:?}, using defaults", e);
            let config = Config::default();

            // Try to save default config to NVS for next time
            if let Err(save_err) = config.save(nvs) {
                log::warn!("Failed to save default config to NVS: {:?}", save_err);
            }

            Ok(config)
        }
    }
}

#[cfg(target_os = "espidf")]
fn load_from_nvs(nvs_partition: &EspDefaultNvsPartition) -> Result<Config> {
    let nvs = EspNvs::new(nvs_partition.clone(), CONFIG_NAMESPACE, true)?;

    let mut buf = vec![0u8; 2048]; // Max config size
    let data = nvs
        .get_blob(CONFIG_KEY, &mut buf)?
        .ok_or_else(|| anyhow::anyhow!("Config not found in NVS"))?;

    let config: Config = serde_json::from_slice(data)?;

    Ok(config)
}

#[cfg(target_os = "espidf")]
fn save_to_nvs(nvs_partition: &EspDefaultNvsPartition, config: &Config) -> Result<()> {
    let mut nvs = EspNvs::new(nvs_partition.clone(), CONFIG_NAMESPACE, false)?;

    let json = serde_json::to_vec(config)?;
    nvs.set_blob(CONFIG_KEY, &json)?;

    Ok(())
}
