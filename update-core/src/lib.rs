//! Update Core - Hardware-independent firmware update logic for the ESP32 web updater
//!
//! This crate contains the update session state machine and everything around it
//! that can be tested on the host platform without ESP32 hardware: the chunked
//! flash writer, image validation, multipart upload decoding and an in-memory
//! flash provider.

pub mod config;
pub mod error;
pub mod flash;
pub mod image;
pub mod multipart;
pub mod ram_flash;
pub mod report;
pub mod restart;
pub mod session;
pub mod transport;
pub mod validate;
pub mod writer;

pub use config::{ConfigError, UpdateConfig, ValidationConfig};
pub use error::{ErrorKind, UpdateError};
pub use flash::{FlashError, FlashStorage, SlotId};
pub use ram_flash::RamFlash;
pub use report::UpdateReport;
pub use restart::{restart_if_committed, Restart};
pub use session::{UpdateSession, UpdateState};
pub use transport::{receive_upload, BodyKind, UploadDriver, UploadEvent, UploadOutcome};
pub use validate::{ImageValidator, ValidationPolicy};
