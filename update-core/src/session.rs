// Update session - turns begin/write/end/abort calls into one flash transaction

use std::fmt;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, UpdateConfig};
use crate::error::{ErrorKind, Result, UpdateError};
use crate::flash::{FlashError, FlashStorage, SlotId};
use crate::image::{to_hex, ImageDigest};
use crate::report::UpdateReport;
use crate::validate::{FinalImage, ValidationFailure, ValidationPolicy};
use crate::writer::ChunkedWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateState {
    Idle,
    Receiving,
    Finalizing,
    Committed,
    Failed,
}

impl UpdateState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpdateState::Committed | UpdateState::Failed)
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateState::Idle => "Idle",
            UpdateState::Receiving => "Receiving",
            UpdateState::Finalizing => "Finalizing",
            UpdateState::Committed => "Committed",
            UpdateState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// One firmware upload, from `begin` to `Committed` or `Failed`.
///
/// The session holds the flash provider for its whole life, so only one can exist
/// per provider. The running image is only ever replaced by a successful
/// [`commit`](Self::commit); every failure discards the reserved slot and leaves the
/// boot selector alone. Both terminal states are final: retrying means creating a
/// new session.
pub struct UpdateSession<'f, F: FlashStorage> {
    flash: &'f mut F,
    policy: ValidationPolicy,
    max_image_size: Option<usize>,
    block_size: Option<usize>,
    progress_step: u8,

    state: UpdateState,
    expected_size: Option<usize>,
    bytes_written: usize,
    limit: usize,
    target_slot: Option<SlotId>,
    handle: Option<F::Handle>,
    writer: Option<ChunkedWriter>,
    digest: ImageDigest,
    last_logged_percent: u8,
    failure: Option<UpdateError>,
}

impl<'f, F: FlashStorage> UpdateSession<'f, F> {
    /// Session with length checks only.
    pub fn new(flash: &'f mut F) -> Self {
        Self::with_policy(flash, ValidationPolicy::length_only())
    }

    pub fn with_policy(flash: &'f mut F, policy: ValidationPolicy) -> Self {
        Self {
            flash,
            policy,
            max_image_size: None,
            block_size: None,
            progress_step: 10,
            state: UpdateState::Idle,
            expected_size: None,
            bytes_written: 0,
            limit: 0,
            target_slot: None,
            handle: None,
            writer: None,
            digest: ImageDigest::new(),
            last_logged_percent: 0,
            failure: None,
        }
    }

    pub fn from_config(flash: &'f mut F, config: &UpdateConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let policy = ValidationPolicy::from_config(&config.validation)?;
        let mut session = Self::with_policy(flash, policy);
        session.max_image_size = config.max_image_size;
        session.block_size = config.write_block_size;
        session.progress_step = config.progress_log_step;
        Ok(session)
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn expected_size(&self) -> Option<usize> {
        self.expected_size
    }

    /// Bytes accepted so far. Accepted bytes are persisted or buffered for the
    /// next block, and every buffered byte is flushed before validation.
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn target_slot(&self) -> Option<SlotId> {
        self.target_slot
    }

    /// Set only once the session has failed.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.failure.as_ref().map(UpdateError::kind)
    }

    pub fn failure(&self) -> Option<&UpdateError> {
        self.failure.as_ref()
    }

    pub fn is_committed(&self) -> bool {
        self.state == UpdateState::Committed
    }

    pub fn progress_percent(&self) -> Option<u8> {
        match (self.state, self.expected_size) {
            (UpdateState::Committed, _) => Some(100),
            (_, Some(0)) => Some(0),
            (_, Some(total)) => Some(((self.bytes_written.min(total) * 100) / total) as u8),
            (_, None) => None,
        }
    }

    pub fn report(&self) -> UpdateReport {
        UpdateReport {
            state: self.state,
            expected_size: self.expected_size,
            bytes_written: self.bytes_written,
            target_slot: self.target_slot,
            last_error: self.last_error(),
            message: self.failure.as_ref().map(ToString::to_string),
            progress_percent: self.progress_percent(),
        }
    }

    /// `Idle -> Receiving`: reserve the inactive slot for an image of
    /// `expected_size` bytes, or of unknown size.
    pub fn begin(&mut self, expected_size: Option<usize>) -> Result<()> {
        if self.state != UpdateState::Idle {
            return Err(self.reject("begin"));
        }

        if let (Some(requested), Some(limit)) = (expected_size, self.max_image_size) {
            if requested > limit {
                return Err(self.fail(UpdateError::TooLarge { requested, limit }));
            }
        }

        let Some(slot) = self.flash.inactive_slot() else {
            return Err(self.fail(UpdateError::Allocation(FlashError::NoInactiveSlot)));
        };
        let capacity = self.flash.slot_capacity(slot);
        if let Some(requested) = expected_size {
            if requested > capacity {
                return Err(self.fail(UpdateError::Allocation(FlashError::InsufficientSpace {
                    slot,
                    requested,
                    capacity,
                })));
            }
        }

        self.target_slot = Some(slot);
        let handle = match self.flash.reserve(slot, expected_size) {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(UpdateError::Allocation(e))),
        };

        let block = self
            .block_size
            .unwrap_or_else(|| self.flash.write_block_size());
        self.handle = Some(handle);
        self.writer = Some(ChunkedWriter::new(block));
        self.expected_size = expected_size;
        self.limit = match (expected_size, self.max_image_size) {
            (Some(declared), _) => declared,
            (None, Some(max)) => max.min(capacity),
            (None, None) => capacity,
        };
        self.state = UpdateState::Receiving;

        match expected_size {
            Some(size) => info!("OTA: receiving {size} bytes into {slot}"),
            None => info!("OTA: receiving image of unknown size into {slot} ({capacity} bytes max)"),
        }
        Ok(())
    }

    /// Append `chunk` to the image. Returns the number of bytes accepted, which is
    /// always the chunk length; anything less fails the session.
    pub fn write(&mut self, chunk: &[u8]) -> Result<usize> {
        if self.state != UpdateState::Receiving {
            return Err(self.reject("write"));
        }
        if chunk.is_empty() {
            return Ok(0);
        }

        let attempted = self.bytes_written + chunk.len();
        if attempted > self.limit {
            return Err(self.fail(UpdateError::Overflow {
                limit: self.limit,
                attempted,
            }));
        }

        let result = match (self.handle.as_mut(), self.writer.as_mut()) {
            (Some(handle), Some(writer)) => writer.write(&mut *self.flash, handle, chunk),
            _ => Err(FlashError::Device("update slot is not open".to_string())),
        };
        let accepted = match result {
            Ok(n) if n == chunk.len() => n,
            Ok(written) => {
                let short = FlashError::ShortWrite {
                    requested: chunk.len(),
                    written,
                };
                return Err(self.fail(UpdateError::Write(short)));
            }
            Err(e) => return Err(self.fail(UpdateError::Write(e))),
        };

        self.digest.update(chunk);
        self.bytes_written += accepted;
        self.log_progress();
        Ok(accepted)
    }

    /// `Receiving -> Finalizing`: no more data, flush the buffered tail.
    /// Returns the final image length.
    pub fn seal(&mut self) -> Result<usize> {
        if self.state != UpdateState::Receiving {
            return Err(self.reject("seal"));
        }
        self.state = UpdateState::Finalizing;

        let result = match (self.handle.as_mut(), self.writer.as_mut()) {
            (Some(handle), Some(writer)) => writer.finish(&mut *self.flash, handle),
            _ => Err(FlashError::Device("update slot is not open".to_string())),
        };
        match result {
            Ok(persisted) if persisted == self.bytes_written => {}
            Ok(persisted) => {
                let short = FlashError::ShortWrite {
                    requested: self.bytes_written,
                    written: persisted,
                };
                return Err(self.fail(UpdateError::Write(short)));
            }
            Err(e) => return Err(self.fail(UpdateError::Write(e))),
        }

        debug!("OTA: sealed image at {} bytes", self.bytes_written);
        Ok(self.bytes_written)
    }

    /// `Finalizing -> Committed | Failed`: validate the image and make the slot the
    /// next boot target.
    pub fn commit(&mut self) -> Result<()> {
        if self.state != UpdateState::Finalizing {
            return Err(self.reject("commit"));
        }

        let image = FinalImage {
            expected_size: self.expected_size,
            summary: self.digest.summary(),
        };
        if let Err(failure) = self.policy.run(&image) {
            return Err(self.fail(UpdateError::Validation(failure)));
        }

        let Some(handle) = self.handle.take() else {
            return Err(self.fail(UpdateError::Write(FlashError::Device(
                "update slot is not open".to_string(),
            ))));
        };
        if let Err(e) = self.flash.commit(handle, self.bytes_written) {
            let err = match e {
                FlashError::ImageRejected(reason) => UpdateError::Validation(ValidationFailure {
                    check: "flash-provider",
                    reason,
                }),
                other => UpdateError::Write(other),
            };
            return Err(self.fail(err));
        }

        self.writer = None;
        self.state = UpdateState::Committed;
        info!(
            "OTA: committed {} bytes to {} (sha256 {})",
            self.bytes_written,
            self.target_slot.map(|s| s.to_string()).unwrap_or_default(),
            to_hex(&image.summary.sha256)
        );
        Ok(())
    }

    /// `Receiving -> Finalizing -> Committed | Failed`.
    pub fn end(&mut self) -> Result<()> {
        if self.state != UpdateState::Receiving {
            return Err(self.reject("end"));
        }
        self.seal()?;
        self.commit()
    }

    /// Give up on the upload and release the slot. A no-op on a failed session.
    pub fn abort(&mut self) -> Result<()> {
        match self.state {
            UpdateState::Failed => Ok(()),
            UpdateState::Committed => Err(self.reject("abort")),
            UpdateState::Idle | UpdateState::Receiving | UpdateState::Finalizing => {
                self.fail(UpdateError::Aborted);
                Ok(())
            }
        }
    }

    fn log_progress(&mut self) {
        match self.progress_percent() {
            Some(percent) if percent >= self.last_logged_percent.saturating_add(self.progress_step) => {
                self.last_logged_percent = percent - percent % self.progress_step.max(1);
                info!(
                    "OTA progress: {percent}% ({}/{} bytes)",
                    self.bytes_written,
                    self.expected_size.unwrap_or_default()
                );
            }
            Some(_) => {}
            None => debug!("OTA progress: {} bytes", self.bytes_written),
        }
    }

    /// Wrong-state call. Ends a live session, leaves a finished one as it is.
    fn reject(&mut self, operation: &'static str) -> UpdateError {
        let err = UpdateError::Protocol {
            operation,
            state: self.state,
        };
        if self.state.is_terminal() {
            warn!("OTA: {err}");
            err
        } else {
            self.fail(err)
        }
    }

    fn fail(&mut self, err: UpdateError) -> UpdateError {
        if let Some(handle) = self.handle.take() {
            self.flash.discard(handle);
        }
        self.writer = None;
        self.state = UpdateState::Failed;
        match err.kind() {
            ErrorKind::Aborted => warn!("OTA: aborted after {} bytes", self.bytes_written),
            kind => error!("OTA: {kind}: {err}"),
        }
        self.failure = Some(err.clone());
        err
    }
}

impl<'f, F: FlashStorage> Drop for UpdateSession<'f, F> {
    fn drop(&mut self) {
        // Release the slot if the caller bailed out mid-upload
        if matches!(self.state, UpdateState::Receiving | UpdateState::Finalizing) {
            let _ = self.abort();
        }
    }
}

impl<'f, F: FlashStorage> fmt::Debug for UpdateSession<'f, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateSession")
            .field("state", &self.state)
            .field("expected_size", &self.expected_size)
            .field("bytes_written", &self.bytes_written)
            .field("target_slot", &self.target_slot)
            .field("last_error", &self.last_error())
            .field("policy", &self.policy)
            .finish()
    }
}
