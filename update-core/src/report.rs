use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::flash::SlotId;
use crate::session::UpdateState;

/// Snapshot of an update session for logs and the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub state: UpdateState,
    pub expected_size: Option<usize>,
    pub bytes_written: usize,
    pub target_slot: Option<SlotId>,
    pub last_error: Option<ErrorKind>,
    pub message: Option<String>,
    pub progress_percent: Option<u8>,
}

impl UpdateReport {
    /// The plain-text answer for the uploading client.
    pub fn status_text(&self) -> &'static str {
        if self.state == UpdateState::Committed {
            "OK"
        } else {
            "FAIL"
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
