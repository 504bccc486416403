// OTA (Over-The-Air) update module

pub mod pages;
pub mod status;

#[cfg(target_os = "espidf")]
pub mod flash;
#[cfg(target_os = "espidf")]
pub mod restart;
#[cfg(target_os = "espidf")]
pub mod web_server;

#[cfg(target_os = "espidf")]
pub use flash::EspOtaFlash;
#[cfg(target_os = "espidf")]
pub use web_server::OtaWebServer;

// OTA update flow:
// 1. Browser posts the image to /update (multipart form or raw body)
// 2. Session writes it into the next OTA partition
// 3. Image is validated and made the boot partition
// 4. Response goes out, then the device restarts
