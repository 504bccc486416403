use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flash::FlashError;
use crate::session::UpdateState;
use crate::validate::ValidationFailure;

/// Coarse classification of a session failure, reported to the network caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    AllocationError,
    WriteError,
    OverflowError,
    ValidationError,
    ProtocolError,
    Aborted,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AllocationError => "AllocationError",
            ErrorKind::WriteError => "WriteError",
            ErrorKind::OverflowError => "OverflowError",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::ProtocolError => "ProtocolError",
            ErrorKind::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error("cannot open update slot: {0}")]
    Allocation(FlashError),

    #[error("declared image size {requested} exceeds the {limit} byte limit")]
    TooLarge { requested: usize, limit: usize },

    #[error("flash write failed: {0}")]
    Write(FlashError),

    #[error("image overflow: {attempted} bytes exceed the {limit} byte limit")]
    Overflow { limit: usize, attempted: usize },

    #[error("image rejected: {0}")]
    Validation(ValidationFailure),

    #[error("{operation} is not allowed while {state}")]
    Protocol {
        operation: &'static str,
        state: UpdateState,
    },

    #[error("update aborted")]
    Aborted,
}

impl UpdateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Allocation(_) | UpdateError::TooLarge { .. } => {
                ErrorKind::AllocationError
            }
            UpdateError::Write(_) => ErrorKind::WriteError,
            UpdateError::Overflow { .. } => ErrorKind::OverflowError,
            UpdateError::Validation(_) => ErrorKind::ValidationError,
            UpdateError::Protocol { .. } => ErrorKind::ProtocolError,
            UpdateError::Aborted => ErrorKind::Aborted,
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
