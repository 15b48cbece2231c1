//! Error mapping guide:
//! - Map io::ErrorKind::NotFound to exit code 127; all others to 1.
//! - Completed runs exit 0; runs stopped with a reason exit 2.
//! - Prefer StoreError/SessionError for internal clarity while preserving
//!   user-visible strings via display_* helpers.
use std::io;

use crate::codes::ReasonCode;

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (missing binary or input)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

/// Exit code for a finished run: 0 completed, 2 stopped with a reason,
/// 1 failed outright.
pub fn exit_code_for_run(status: &crate::state::RunStatus) -> u8 {
    match status {
        crate::state::RunStatus::Completed => 0,
        crate::state::RunStatus::Stopped => 2,
        _ => 1,
    }
}

/// Run store failures: disk I/O or a state file that no longer parses.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Corrupt(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Director session failures; a malformed session file is surfaced as
/// SESSION_CORRUPTED and never auto-recovered.
#[derive(Debug)]
pub enum SessionError {
    Io(std::io::Error),
    Corrupted(String),
    InvalidTransition { from: String, to: String },
    UnknownFrame(u32),
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

impl SessionError {
    pub fn reason_code(&self) -> Option<ReasonCode> {
        match self {
            SessionError::Corrupted(_) => Some(ReasonCode::SessionCorrupted),
            _ => None,
        }
    }
}

pub fn display_for_store_error(e: &StoreError) -> String {
    match e {
        StoreError::Io(ioe) => ioe.to_string(),
        StoreError::Corrupt(s) => format!("state file corrupt: {s}"),
    }
}

pub fn display_for_session_error(e: &SessionError) -> String {
    match e {
        SessionError::Io(ioe) => ioe.to_string(),
        SessionError::Corrupted(s) => format!("SESSION_CORRUPTED: {s}"),
        SessionError::InvalidTransition { from, to } => {
            format!("invalid session frame transition {from} -> {to}")
        }
        SessionError::UnknownFrame(i) => format!("unknown frame index {i}"),
    }
}
