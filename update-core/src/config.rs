/// Update settings that can be tested independently of the firmware
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image::parse_sha256_hex;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("expected_sha256 is not a 64 digit hex digest: {0:?}")]
    BadDigest(String),

    #[error("max_image_size must be greater than zero")]
    ZeroImageLimit,

    #[error("write_block_size must be a power of two, got {0}")]
    BadBlockSize(usize),

    #[error("progress_log_step must be between 1 and 100, got {0}")]
    BadProgressStep(u8),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Reject anything that does not start with an ESP-IDF app image header.
    pub require_esp_header: bool,
    /// Check the SHA-256 trailer of images built with `append_digest`.
    pub verify_appended_digest: bool,
    /// Only accept this exact image.
    pub expected_sha256: Option<String>,
    /// `esp_chip_id_t` the image must target, if set.
    pub chip_id: Option<u16>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            require_esp_header: true,
            verify_appended_digest: true,
            expected_sha256: None,
            chip_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpdateConfig {
    /// Largest image `begin` will reserve for; `None` leaves it to the slot size.
    pub max_image_size: Option<usize>,
    /// Overrides the provider's write block size.
    pub write_block_size: Option<usize>,
    pub restart_delay_ms: u64,
    /// Log upload progress every this many percent (known sizes only).
    pub progress_log_step: u8,
    pub validation: ValidationConfig,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_image_size: None,
            write_block_size: None,
            restart_delay_ms: 1000,
            progress_log_step: 10,
            validation: ValidationConfig::default(),
        }
    }
}

impl UpdateConfig {
    /// Plain length checks only, for uploads that are not ESP app images.
    pub fn permissive() -> Self {
        Self {
            validation: ValidationConfig {
                require_esp_header: false,
                verify_appended_digest: false,
                ..ValidationConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_image_size == Some(0) {
            return Err(ConfigError::ZeroImageLimit);
        }
        if let Some(block) = self.write_block_size {
            if !block.is_power_of_two() {
                return Err(ConfigError::BadBlockSize(block));
            }
        }
        if !(1..=100).contains(&self.progress_log_step) {
            return Err(ConfigError::BadProgressStep(self.progress_log_step));
        }
        if let Some(hex) = &self.validation.expected_sha256 {
            if parse_sha256_hex(hex).is_none() {
                return Err(ConfigError::BadDigest(hex.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_config_serialization() {
        let config = UpdateConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: UpdateConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: UpdateConfig =
            serde_json::from_str(r#"{"max_image_size": 1572864, "validation": {"chip_id": 9}}"#)
                .unwrap();
        assert_eq!(config.max_image_size, Some(1_572_864));
        assert_eq!(config.restart_delay_ms, 1000);
        assert!(config.validation.require_esp_header);
        assert_eq!(config.validation.chip_id, Some(9));
    }

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(UpdateConfig::default().validate(), Ok(()));
        assert_eq!(UpdateConfig::permissive().validate(), Ok(()));
        assert!(!UpdateConfig::permissive().validation.require_esp_header);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = UpdateConfig::default();
        config.max_image_size = Some(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroImageLimit));

        let mut config = UpdateConfig::default();
        config.write_block_size = Some(3000);
        assert_eq!(config.validate(), Err(ConfigError::BadBlockSize(3000)));

        let mut config = UpdateConfig::default();
        config.progress_log_step = 0;
        assert_eq!(config.validate(), Err(ConfigError::BadProgressStep(0)));

        let mut config = UpdateConfig::default();
        config.validation.expected_sha256 = Some("abcd".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::BadDigest(_))));
    }
}
