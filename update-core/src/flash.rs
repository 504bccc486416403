/// Flash storage provider contract used by the update session.
///
/// A provider owns the device's application slots. The session only ever talks to
/// the inactive slot it reserved; the running image and the boot selector are
/// touched exclusively by `commit`.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of an application slot (an `ota_N` partition on ESP-IDF).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u8);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ota_{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("no inactive application slot")]
    NoInactiveSlot,

    #[error("slot {slot} holds at most {capacity} bytes, {requested} requested")]
    InsufficientSpace {
        slot: SlotId,
        requested: usize,
        capacity: usize,
    },

    #[error("slot {0} is already reserved")]
    SlotBusy(SlotId),

    #[error("short write: {written} of {requested} bytes persisted")]
    ShortWrite { requested: usize, written: usize },

    #[error("write of {len} bytes at offset {offset} breaks the {block}-byte write block")]
    Misaligned {
        offset: usize,
        len: usize,
        block: usize,
    },

    #[error("image rejected: {0}")]
    ImageRejected(String),

    #[error("flash device error: {0}")]
    Device(String),
}

/// Storage backend for firmware images.
///
/// `write` reports how many bytes were persisted; anything other than the full
/// input length is treated as fatal by the caller. Every write except the last one
/// of an image is a multiple of [`FlashStorage::write_block_size`].
///
/// `commit` consumes the handle. On failure the provider must release whatever the
/// handle held, and the boot selector must keep pointing at the running image.
pub trait FlashStorage {
    type Handle;

    /// The slot a new image would be written to, if the partition layout has one.
    fn inactive_slot(&self) -> Option<SlotId>;

    fn slot_capacity(&self, slot: SlotId) -> usize;

    fn write_block_size(&self) -> usize {
        4096
    }

    fn reserve(&mut self, slot: SlotId, size_hint: Option<usize>)
        -> Result<Self::Handle, FlashError>;

    fn write(&mut self, handle: &mut Self::Handle, bytes: &[u8]) -> Result<usize, FlashError>;

    /// Seal the slot at `final_size` bytes and make it the next boot target.
    fn commit(&mut self, handle: Self::Handle, final_size: usize) -> Result<(), FlashError>;

    /// Drop a reservation without touching the boot selector.
    fn discard(&mut self, handle: Self::Handle);
}
