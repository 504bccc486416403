// ESP-IDF flash provider - update sessions write through esp_ota_* into the next OTA partition

use core::ffi::{c_void, CStr};
use esp_idf_sys::{
    esp, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_get_running_partition, esp_ota_handle_t, esp_ota_mark_app_valid_cancel_rollback,
    esp_ota_set_boot_partition, esp_ota_write, esp_partition_find_first,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MIN,
    esp_partition_type_t_ESP_PARTITION_TYPE_APP, esp_partition_t, EspError,
    ESP_ERR_OTA_VALIDATE_FAILED, OTA_SIZE_UNKNOWN,
};
use update_core::{FlashError, FlashStorage, SlotId};

pub struct EspOtaHandle {
    handle: esp_ota_handle_t,
    partition: *const esp_partition_t,
    slot: SlotId,
    written: usize,
}

/// Stateless view of the OTA partitions. The partition table lives in flash
/// for the whole program, so partition pointers are looked up per call.
#[derive(Debug, Default)]
pub struct EspOtaFlash;

impl EspOtaFlash {
    pub fn new() -> Self {
        Self
    }

    /// Label of the partition the firmware booted from (e.g. `ota_0`).
    pub fn running_label(&self) -> Option<String> {
        let running = unsafe { esp_ota_get_running_partition() };
        partition_label(running)
    }

    /// Cancel a pending rollback, if the bootloader is waiting for one.
    pub fn confirm_running_image(&self) {
        match esp!(unsafe { esp_ota_mark_app_valid_cancel_rollback() }) {
            Ok(()) => log::info!("Running image marked valid"),
            Err(e) => log::warn!("Failed to mark running image valid: {}", e),
        }
    }
}

fn slot_of(partition: *const esp_partition_t) -> Option<SlotId> {
    if partition.is_null() {
        return None;
    }
    let subtype = unsafe { (*partition).subtype };
    subtype
        .checked_sub(esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MIN)
        .and_then(|n| u8::try_from(n).ok())
        .map(SlotId)
}

fn partition_label(partition: *const esp_partition_t) -> Option<String> {
    if partition.is_null() {
        return None;
    }
    let label = unsafe { CStr::from_ptr((*partition).label.as_ptr()) };
    Some(label.to_string_lossy().into_owned())
}

fn find_slot(slot: SlotId) -> *const esp_partition_t {
    unsafe {
        esp_partition_find_first(
            esp_partition_type_t_ESP_PARTITION_TYPE_APP,
            esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MIN + u32::from(slot.0),
            core::ptr::null(),
        )
    }
}

fn device(op: &str, e: EspError) -> FlashError {
    FlashError::Device(format!("{op}: {e}"))
}

impl FlashStorage for EspOtaFlash {
    type Handle = EspOtaHandle;

    fn inactive_slot(&self) -> Option<SlotId> {
        slot_of(unsafe { esp_ota_get_next_update_partition(core::ptr::null()) })
    }

    fn slot_capacity(&self, slot: SlotId) -> usize {
        let partition = find_slot(slot);
        if partition.is_null() {
            return 0;
        }
        unsafe { (*partition).size as usize }
    }

    fn reserve(&mut self, slot: SlotId, size_hint: Option<usize>) -> Result<EspOtaHandle, FlashError> {
        let partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
        match slot_of(partition) {
            None => return Err(FlashError::NoInactiveSlot),
            Some(next) if next != slot => {
                return Err(FlashError::Device(format!("{slot} is not the next update slot ({next} is)")))
            }
            Some(_) => {}
        }

        // Erases the slot, either the hinted size or all of it
        let image_size = size_hint.map_or(OTA_SIZE_UNKNOWN as usize, |size| size);
        let mut handle: esp_ota_handle_t = 0;
        esp!(unsafe { esp_ota_begin(partition, image_size as _, &mut handle as *mut _) })
            .map_err(|e| device("esp_ota_begin", e))?;

        log::debug!(
            "esp_ota_begin on {} ({:?})",
            partition_label(partition).unwrap_or_default(),
            size_hint
        );
        Ok(EspOtaHandle {
            handle,
            partition,
            slot,
            written: 0,
        })
    }

    fn write(&mut self, handle: &mut EspOtaHandle, bytes: &[u8]) -> Result<usize, FlashError> {
        esp!(unsafe { esp_ota_write(handle.handle, bytes.as_ptr() as *const c_void, bytes.len() as _) })
            .map_err(|e| device("esp_ota_write", e))?;
        handle.written += bytes.len();
        Ok(bytes.len())
    }

    fn commit(&mut self, handle: EspOtaHandle, final_size: usize) -> Result<(), FlashError> {
        if final_size != handle.written {
            let written = handle.written;
            self.discard(handle);
            return Err(FlashError::ImageRejected(format!(
                "{final_size} bytes declared, {written} written"
            )));
        }

        // esp_ota_end releases the handle whatever the result
        if let Err(e) = esp!(unsafe { esp_ota_end(handle.handle) }) {
            if e.code() == ESP_ERR_OTA_VALIDATE_FAILED as i32 {
                return Err(FlashError::ImageRejected(
                    "bootloader image verification failed".to_string(),
                ));
            }
            return Err(device("esp_ota_end", e));
        }

        esp!(unsafe { esp_ota_set_boot_partition(handle.partition) })
            .map_err(|e| device("esp_ota_set_boot_partition", e))?;

        log::info!("Boot partition set to {}", handle.slot);
        Ok(())
    }

    fn discard(&mut self, handle: EspOtaHandle) {
        if let Err(e) = esp!(unsafe { esp_ota_abort(handle.handle) }) {
            log::warn!("esp_ota_abort failed: {}", e);
        }
        log::debug!("Discarded update of {}", handle.slot);
    }
}
