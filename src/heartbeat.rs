// Status LED heartbeat - toggles while the firmware is alive

use anyhow::Result;
use esp_idf_hal::gpio::{AnyOutputPin, PinDriver};
use std::time::Duration;

pub fn start(gpio: u8, interval: Duration) -> Result<()> {
    // The pin number comes from config; nothing else drives this GPIO
    let pin = unsafe { AnyOutputPin::new(i32::from(gpio)) };
    let mut led = PinDriver::output(pin)?;

    std::thread::Builder::new()
        .name("heartbeat".into())
        .stack_size(2048)
        .spawn(move || loop {
            if let Err(e) = led.toggle() {
                log::warn!("LED toggle failed: {:?}", e);
            }
            std::thread::sleep(interval);
        })?;

    log::info!("Heartbeat LED on GPIO{} every {:?}", gpio, interval);
    Ok(())
}
