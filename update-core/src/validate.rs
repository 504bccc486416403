//! Finalize-time image checks.
//!
//! A [`ValidationPolicy`] is an ordered list of [`ImageValidator`]s run against
//! the digest of everything the session accepted. The first failing check wins.
//! `NonEmpty` always runs first, whatever else the policy layers on top.

use std::fmt;

use log::debug;
use thiserror::Error;

use crate::config::{ConfigError, ValidationConfig};
use crate::image::{parse_sha256_hex, to_hex, ImageSummary, DIGEST_LEN, ESP_IMAGE_MAGIC, MAX_SEGMENTS};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{check}: {reason}")]
pub struct ValidationFailure {
    pub check: &'static str,
    pub reason: String,
}

/// What the validators get to see once the upload has ended.
#[derive(Debug, Clone)]
pub struct FinalImage {
    pub expected_size: Option<usize>,
    pub summary: ImageSummary,
}

impl FinalImage {
    pub fn len(&self) -> usize {
        self.summary.len
    }

    pub fn is_empty(&self) -> bool {
        self.summary.len == 0
    }
}

pub trait ImageValidator: Send {
    fn name(&self) -> &'static str;

    fn check(&self, image: &FinalImage) -> Result<(), String>;
}

pub struct NonEmpty;

impl ImageValidator for NonEmpty {
    fn name(&self) -> &'static str {
        "non-empty"
    }

    fn check(&self, image: &FinalImage) -> Result<(), String> {
        if image.is_empty() {
            return Err("no image data received".to_string());
        }
        Ok(())
    }
}

/// A declared size must match what actually arrived.
pub struct DeclaredLength;

impl ImageValidator for DeclaredLength {
    fn name(&self) -> &'static str {
        "declared-length"
    }

    fn check(&self, image: &FinalImage) -> Result<(), String> {
        match image.expected_size {
            Some(expected) if expected != image.len() => Err(format!(
                "{} bytes received, {expected} declared",
                image.len()
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct EspImageHeader {
    pub chip_id: Option<u16>,
}

impl ImageValidator for EspImageHeader {
    fn name(&self) -> &'static str {
        "esp-image-header"
    }

    fn check(&self, image: &FinalImage) -> Result<(), String> {
        let header = image
            .summary
            .header
            .ok_or_else(|| format!("{} bytes is too short for an image header", image.len()))?;

        if header.magic != ESP_IMAGE_MAGIC {
            return Err(format!("bad magic byte {:#04x}", header.magic));
        }
        if header.segment_count == 0 || header.segment_count > MAX_SEGMENTS {
            return Err(format!("implausible segment count {}", header.segment_count));
        }
        if let Some(expected) = self.chip_id {
            if header.chip_id() != expected {
                return Err(format!(
                    "image targets chip id {}, this device is {expected}",
                    header.chip_id()
                ));
            }
        }
        Ok(())
    }
}

/// Checks the SHA-256 trailer when the image header announces one.
pub struct AppendedDigest;

impl ImageValidator for AppendedDigest {
    fn name(&self) -> &'static str {
        "appended-digest"
    }

    fn check(&self, image: &FinalImage) -> Result<(), String> {
        let Some(header) = image.summary.header else {
            return Ok(());
        };
        if !header.has_appended_digest() {
            return Ok(());
        }
        match image.summary.appended {
            Some(digest) if digest.matches() => Ok(()),
            Some(digest) => Err(format!(
                "trailer {} does not match body digest {}",
                to_hex(&digest.trailer),
                to_hex(&digest.body)
            )),
            None => Err("image too short to carry its digest".to_string()),
        }
    }
}

pub struct ExpectedDigest([u8; DIGEST_LEN]);

impl ExpectedDigest {
    pub fn new(digest: [u8; DIGEST_LEN]) -> Self {
        Self(digest)
    }

    pub fn from_hex(text: &str) -> Option<Self> {
        parse_sha256_hex(text).map(Self)
    }
}

impl ImageValidator for ExpectedDigest {
    fn name(&self) -> &'static str {
        "expected-digest"
    }

    fn check(&self, image: &FinalImage) -> Result<(), String> {
        if image.summary.sha256 != self.0 {
            return Err(format!(
                "sha256 {} differs from expected {}",
                to_hex(&image.summary.sha256),
                to_hex(&self.0)
            ));
        }
        Ok(())
    }
}

pub struct ValidationPolicy {
    validators: Vec<Box<dyn ImageValidator>>,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::length_only()
    }
}

impl fmt::Debug for ValidationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl ValidationPolicy {
    /// Non-empty image, and the declared length when one was given.
    pub fn length_only() -> Self {
        Self {
            validators: vec![Box::new(NonEmpty), Box::new(DeclaredLength)],
        }
    }

    pub fn with(mut self, validator: impl ImageValidator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    pub fn from_config(config: &ValidationConfig) -> Result<Self, ConfigError> {
        let mut policy = Self::length_only();
        if config.require_esp_header {
            policy = policy.with(EspImageHeader {
                chip_id: config.chip_id,
            });
        }
        if config.verify_appended_digest {
            policy = policy.with(AppendedDigest);
        }
        if let Some(hex) = &config.expected_sha256 {
            let digest = ExpectedDigest::from_hex(hex)
                .ok_or_else(|| ConfigError::BadDigest(hex.clone()))?;
            policy = policy.with(digest);
        }
        Ok(policy)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.validators.iter().map(|v| v.name())
    }

    pub fn run(&self, image: &FinalImage) -> Result<(), ValidationFailure> {
        for validator in &self.validators {
            validator.check(image).map_err(|reason| ValidationFailure {
                check: validator.name(),
                reason,
            })?;
            debug!("validation: {} passed", validator.name());
        }
        Ok(())
    }
}
