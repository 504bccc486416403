//! ESP-IDF application image inspection.
//!
//! The upload is never read back from flash. Instead every accepted byte is fed
//! through an [`ImageDigest`] that keeps what the validators need: the leading
//! image header, the total length, and SHA-256 digests of the whole image and of
//! the image without its trailing 32 bytes (where ESP-IDF appends its own digest).

use std::fmt::Write as _;
use std::mem::size_of;

use bytemuck::{Pod, Zeroable};
use sha2::{Digest, Sha256};

pub const ESP_IMAGE_MAGIC: u8 = 0xE9;
pub const IMAGE_HEADER_LEN: usize = size_of::<ImageHeader>();
pub const DIGEST_LEN: usize = 32;
pub const MAX_SEGMENTS: u8 = 16;

/// Application image header as laid out by the ESP-IDF bootloader
/// (`esp_image_header_t`, common plus extended part).
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub struct ImageHeader {
    pub magic: u8,
    pub segment_count: u8,
    pub flash_mode: u8,
    pub flash_config: u8,
    entry: u32,
    pub wp_pin: u8,
    pub clk_q_drv: u8,
    pub d_cs_drv: u8,
    pub gd_wp_drv: u8,
    chip_id: u16,
    pub min_rev: u8,
    min_chip_rev_full: u16,
    max_chip_rev_full: u16,
    pub reserved: [u8; 4],
    pub append_digest: u8,
}

impl ImageHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let raw = bytes.get(..IMAGE_HEADER_LEN)?;
        Some(bytemuck::pod_read_unaligned(raw))
    }

    pub fn entry(&self) -> u32 {
        u32::from_le(self.entry)
    }

    pub fn chip_id(&self) -> u16 {
        u16::from_le(self.chip_id)
    }

    pub fn min_chip_rev_full(&self) -> u16 {
        u16::from_le(self.min_chip_rev_full)
    }

    pub fn max_chip_rev_full(&self) -> u16 {
        u16::from_le(self.max_chip_rev_full)
    }

    pub fn has_appended_digest(&self) -> bool {
        self.append_digest == 1
    }
}

/// Streaming digest over an image whose length is not known up front.
#[derive(Clone)]
pub struct ImageDigest {
    len: usize,
    header: Vec<u8>,
    full: Sha256,
    body: Sha256,
    trailer: Vec<u8>,
}

impl Default for ImageDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageDigest {
    pub fn new() -> Self {
        Self {
            len: 0,
            header: Vec::with_capacity(IMAGE_HEADER_LEN),
            full: Sha256::new(),
            body: Sha256::new(),
            trailer: Vec::with_capacity(DIGEST_LEN * 2),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn update(&mut self, data: &[u8]) {
        self.len += data.len();
        self.full.update(data);

        if self.header.len() < IMAGE_HEADER_LEN {
            let take = (IMAGE_HEADER_LEN - self.header.len()).min(data.len());
            self.header.extend_from_slice(&data[..take]);
        }

        // Hold back the last DIGEST_LEN bytes seen so far
        if data.len() >= DIGEST_LEN {
            let split = data.len() - DIGEST_LEN;
            self.body.update(&self.trailer);
            self.body.update(&data[..split]);
            self.trailer.clear();
            self.trailer.extend_from_slice(&data[split..]);
        } else {
            self.trailer.extend_from_slice(data);
            if self.trailer.len() > DIGEST_LEN {
                let excess = self.trailer.len() - DIGEST_LEN;
                self.body.update(&self.trailer[..excess]);
                self.trailer.drain(..excess);
            }
        }
    }

    pub fn summary(&self) -> ImageSummary {
        let sha256: [u8; DIGEST_LEN] = self.full.clone().finalize().into();
        let appended = if self.trailer.len() == DIGEST_LEN {
            let body: [u8; DIGEST_LEN] = self.body.clone().finalize().into();
            let mut trailer = [0u8; DIGEST_LEN];
            trailer.copy_from_slice(&self.trailer);
            Some(AppendedDigest { body, trailer })
        } else {
            None
        };

        ImageSummary {
            len: self.len,
            header: ImageHeader::parse(&self.header),
            sha256,
            appended,
        }
    }
}

/// SHA-256 of everything before the trailing digest, and the trailing digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendedDigest {
    pub body: [u8; DIGEST_LEN],
    pub trailer: [u8; DIGEST_LEN],
}

impl AppendedDigest {
    pub fn matches(&self) -> bool {
        self.body == self.trailer
    }
}

#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub len: usize,
    /// `None` when fewer than a header's worth of bytes arrived.
    pub header: Option<ImageHeader>,
    pub sha256: [u8; DIGEST_LEN],
    /// `None` for images shorter than one digest.
    pub appended: Option<AppendedDigest>,
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Parse a 64 character hex SHA-256 digest (either case).
pub fn parse_sha256_hex(text: &str) -> Option<[u8; DIGEST_LEN]> {
    let text = text.trim();
    if text.len() != DIGEST_LEN * 2 || !text.is_ascii() {
        return None;
    }
    let mut out = [0u8; DIGEST_LEN];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A plausible ESP32 app image: header, `body_len` filler bytes and, when
    /// `append_digest` is set, the SHA-256 trailer the build tools add.
    pub fn fake_app_image(body_len: usize, append_digest: bool) -> Vec<u8> {
        let header = ImageHeader {
            magic: ESP_IMAGE_MAGIC,
            segment_count: 3,
            flash_mode: 2,
            flash_config: 0x20,
            entry: 0x4008_0000u32.to_le(),
            wp_pin: 0xEE,
            clk_q_drv: 0,
            d_cs_drv: 0,
            gd_wp_drv: 0,
            chip_id: 0u16.to_le(),
            min_rev: 0,
            min_chip_rev_full: 0,
            max_chip_rev_full: 399u16.to_le(),
            reserved: [0; 4],
            append_digest: u8::from(append_digest),
        };
        let mut image = bytemuck::bytes_of(&header).to_vec();
        image.extend((0..body_len).map(|i| (i % 251) as u8));
        if append_digest {
            let digest: [u8; DIGEST_LEN] = Sha256::digest(&image).into();
            image.extend_from_slice(&digest);
        }
        image
    }
}
