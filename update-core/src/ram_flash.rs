/// In-memory flash with a boot selector, used on the host.
///
/// Models an ESP-IDF style layout of N equally sized application slots where the
/// slot after the booted one receives updates. Writes are append-only per
/// reservation and must respect the write block size. Faults can be injected to
/// exercise the session's failure paths.
use log::{debug, warn};

use crate::flash::{FlashError, FlashStorage, SlotId};

pub const DEFAULT_BLOCK_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFault {
    /// Persist only half of the requested bytes and report that count.
    Short,
    /// Fail the call with a device error.
    Device,
}

#[derive(Debug)]
pub struct RamHandle {
    slot: SlotId,
    offset: usize,
}

impl RamHandle {
    pub fn slot(&self) -> SlotId {
        self.slot
    }
}

#[derive(Debug, Clone)]
pub struct RamFlash {
    slots: Vec<Vec<u8>>,
    capacity: usize,
    block_size: usize,
    boot: SlotId,
    reserved: Option<SlotId>,
    write_calls: usize,
    fault: Option<(usize, WriteFault)>,
    reject_commit: Option<String>,
}

impl RamFlash {
    /// Two slots of `capacity` bytes, booting from `ota_0`.
    pub fn new(capacity: usize) -> Self {
        Self::with_slots(2, capacity)
    }

    pub fn with_slots(count: usize, capacity: usize) -> Self {
        Self {
            slots: vec![Vec::new(); count],
            capacity,
            block_size: DEFAULT_BLOCK_SIZE,
            boot: SlotId(0),
            reserved: None,
            write_calls: 0,
            fault: None,
            reject_commit: None,
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Place `image` in the boot slot, as if it were the running firmware.
    pub fn with_running_image(mut self, image: &[u8]) -> Self {
        let boot = usize::from(self.boot.0);
        if let Some(slot) = self.slots.get_mut(boot) {
            *slot = image.to_vec();
        }
        self
    }

    /// Fail the `nth` write call (0-based, counted across the device lifetime).
    pub fn fail_write(&mut self, nth: usize, fault: WriteFault) {
        self.fault = Some((nth, fault));
    }

    /// Make the next `commit` refuse the image, like `esp_ota_end` does when
    /// the bootloader's own checks fail.
    pub fn reject_commit(&mut self, reason: &str) {
        self.reject_commit = Some(reason.to_string());
    }

    pub fn boot_slot(&self) -> SlotId {
        self.boot
    }

    pub fn slot_contents(&self, slot: SlotId) -> &[u8] {
        self.slots
            .get(usize::from(slot.0))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn boot_image(&self) -> &[u8] {
        self.slot_contents(self.boot)
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved.is_some()
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls
    }

    fn slot_mut(&mut self, slot: SlotId) -> Result<&mut Vec<u8>, FlashError> {
        self.slots
            .get_mut(usize::from(slot.0))
            .ok_or_else(|| FlashError::Device(format!("no partition for {slot}")))
    }
}

impl FlashStorage for RamFlash {
    type Handle = RamHandle;

    fn inactive_slot(&self) -> Option<SlotId> {
        if self.slots.len() < 2 {
            return None;
        }
        let next = (usize::from(self.boot.0) + 1) % self.slots.len();
        u8::try_from(next).ok().map(SlotId)
    }

    fn slot_capacity(&self, slot: SlotId) -> usize {
        if usize::from(slot.0) < self.slots.len() {
            self.capacity
        } else {
            0
        }
    }

    fn write_block_size(&self) -> usize {
        self.block_size
    }

    fn reserve(&mut self, slot: SlotId, size_hint: Option<usize>) -> Result<RamHandle, FlashError> {
        if slot == self.boot {
            return Err(FlashError::Device(format!("{slot} is the running slot")));
        }
        if self.reserved.is_some() {
            return Err(FlashError::SlotBusy(slot));
        }
        let capacity = self.slot_capacity(slot);
        if let Some(requested) = size_hint {
            if requested > capacity {
                return Err(FlashError::InsufficientSpace {
                    slot,
                    requested,
                    capacity,
                });
            }
        }

        // Erase
        self.slot_mut(slot)?.clear();
        self.reserved = Some(slot);
        debug!("ram flash: reserved {slot} (hint {size_hint:?})");
        Ok(RamHandle { slot, offset: 0 })
    }

    fn write(&mut self, handle: &mut RamHandle, bytes: &[u8]) -> Result<usize, FlashError> {
        let call = self.write_calls;
        self.write_calls += 1;

        if self.reserved != Some(handle.slot) {
            return Err(FlashError::Device(format!("{} is not reserved", handle.slot)));
        }
        if handle.offset % self.block_size != 0 {
            return Err(FlashError::Misaligned {
                offset: handle.offset,
                len: bytes.len(),
                block: self.block_size,
            });
        }
        if handle.offset + bytes.len() > self.capacity {
            return Err(FlashError::Device(format!(
                "write past the end of {}",
                handle.slot
            )));
        }

        let persist = match self.fault {
            Some((nth, WriteFault::Device)) if nth == call => {
                warn!("ram flash: injected device fault on write #{call}");
                return Err(FlashError::Device("injected fault".to_string()));
            }
            Some((nth, WriteFault::Short)) if nth == call => bytes.len() / 2,
            _ => bytes.len(),
        };

        let slot = handle.slot;
        self.slot_mut(slot)?.extend_from_slice(&bytes[..persist]);
        handle.offset += persist;
        Ok(persist)
    }

    fn commit(&mut self, handle: RamHandle, final_size: usize) -> Result<(), FlashError> {
        self.reserved = None;
        if let Some(reason) = self.reject_commit.take() {
            self.slot_mut(handle.slot)?.clear();
            return Err(FlashError::ImageRejected(reason));
        }
        if final_size != handle.offset {
            self.slot_mut(handle.slot)?.clear();
            return Err(FlashError::ImageRejected(format!(
                "{final_size} bytes declared, {} written",
                handle.offset
            )));
        }
        self.boot = handle.slot;
        debug!("ram flash: boot slot is now {}", handle.slot);
        Ok(())
    }

    fn discard(&mut self, handle: RamHandle) {
        self.reserved = None;
        if let Ok(slot) = self.slot_mut(handle.slot) {
            slot.clear();
        }
        debug!("ram flash: discarded {}", handle.slot);
    }
}
