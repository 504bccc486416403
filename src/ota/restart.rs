use std::time::Duration;

use update_core::Restart;

/// Restarts the chip from a separate thread so the HTTP response gets out first.
pub struct EspRestart {
    pub delay: Duration,
}

impl Restart for EspRestart {
    fn restart(&self) {
        let delay = self.delay;
        let spawned = std::thread::Builder::new()
            .name("restart".into())
            .stack_size(2048)
            .spawn(move || {
                std::thread::sleep(delay);
                log::info!("Restarting system...");
                unsafe { esp_idf_sys::esp_restart() }
            });

        // Without a thread the response may be cut short, but the image is committed
        if let Err(e) = spawned {
            log::warn!("Failed to spawn restart thread ({e}), restarting now");
            unsafe { esp_idf_sys::esp_restart() }
        }
    }
}
