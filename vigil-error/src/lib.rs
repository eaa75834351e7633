//! Unified error handling for Vigil
//!
//! This crate provides the error types shared across all Vigil components:
//! the internal `AgentError` used by the daemon and infrastructure code, the
//! closed `ApiStatus` set returned by every RPC, and the detail `ErrorCode`
//! set that qualifies backend rejections.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Result type alias using AgentError
pub type Result<T> = std::result::Result<T, AgentError>;

/// Internal error type for daemon and infrastructure operations
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Generic(String),
}

impl AgentError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a bus error from a string
    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }
}

impl From<String> for AgentError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

impl From<&str> for AgentError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

/// API status returned by every RPC operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStatus {
    /// operation succeeded
    Ok,
    /// catch-all failure
    Err,
    /// request failed validation
    InvalidArg,
    /// object with the given key already exists
    Exists,
    /// allocation failure
    Oom,
    /// object with the given key does not exist
    NotFound,
    /// operation is not permitted on this object
    NotAllowed,
    /// operation is not supported by the backend
    NotSupported,
    /// object is busy (mutation in flight or subscribers attached)
    InUse,
}

impl ApiStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ApiStatus::Ok)
    }
}

impl std::fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApiStatus::Ok => "ok",
            ApiStatus::Err => "error",
            ApiStatus::InvalidArg => "invalid argument",
            ApiStatus::Exists => "already exists",
            ApiStatus::Oom => "out of memory",
            ApiStatus::NotFound => "not found",
            ApiStatus::NotAllowed => "not allowed",
            ApiStatus::NotSupported => "not supported",
            ApiStatus::InUse => "in use",
        };
        write!(f, "{}", s)
    }
}

/// Detail error codes qualifying backend rejections
///
/// Disjoint from `ApiStatus`; a response carries one of each. `None` means
/// no additional detail beyond the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    None,
    ClockFreqRangeInvalid,
    OverdriveOutOfRange,
    NumClockFreqRangeExceeded,
    DuplicateClockFreqRange,
    ClockTypeFreqRangeUpdateNotSupported,
    GpuPowerCapOutOfRange,
    Unknown,
}

impl Default for ErrorCode {
    fn default() -> Self {
        ErrorCode::None
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::None => "none",
            ErrorCode::ClockFreqRangeInvalid => "clock-frequency-range-invalid",
            ErrorCode::OverdriveOutOfRange => "overdrive-out-of-range",
            ErrorCode::NumClockFreqRangeExceeded => "num-clock-freq-range-exceeded",
            ErrorCode::DuplicateClockFreqRange => "duplicate-clock-freq-range",
            ErrorCode::ClockTypeFreqRangeUpdateNotSupported => {
                "clock-type-freq-range-update-not-supported"
            }
            ErrorCode::GpuPowerCapOutOfRange => "gpu-power-cap-out-of-range",
            ErrorCode::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// API error carrying both the status and the detail code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiError {
    pub status: ApiStatus,
    pub code: ErrorCode,
}

impl ApiError {
    pub fn new(status: ApiStatus, code: ErrorCode) -> Self {
        Self { status, code }
    }

    pub fn invalid_arg() -> Self {
        ApiStatus::InvalidArg.into()
    }

    pub fn not_found() -> Self {
        ApiStatus::NotFound.into()
    }

    pub fn in_use() -> Self {
        ApiStatus::InUse.into()
    }
}

impl From<ApiStatus> for ApiError {
    fn from(status: ApiStatus) -> Self {
        Self {
            status,
            code: ErrorCode::None,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.code == ErrorCode::None {
            write!(f, "{}", self.status)
        } else {
            write!(f, "{} ({})", self.status, self.code)
        }
    }
}

impl std::error::Error for ApiError {}

/// Error returned by SMI backend operations
#[derive(thiserror::Error, Debug, Clone)]
#[error("{msg}")]
pub struct SmiError {
    /// detail code mapped onto the RPC response
    pub code: ErrorCode,
    pub msg: String,
}

impl SmiError {
    pub fn new(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unknown, msg)
    }
}

impl From<SmiError> for ApiError {
    fn from(e: SmiError) -> Self {
        ApiError::new(ApiStatus::Err, e.code)
    }
}

/// Result type alias for SMI backend operations
pub type SmiResult<T> = std::result::Result<T, SmiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_status_serde_uses_snake_case() {
        let s = serde_json::to_string(&ApiStatus::InvalidArg).unwrap();
        assert_eq!(s, "\"invalid_arg\"");
        let back: ApiStatus = serde_json::from_str("\"in_use\"").unwrap();
        assert_eq!(back, ApiStatus::InUse);
    }

    #[test]
    fn smi_error_maps_to_api_error() {
        let e = SmiError::new(ErrorCode::OverdriveOutOfRange, "overdrive 30 out of range");
        let api: ApiError = e.into();
        assert_eq!(api.status, ApiStatus::Err);
        assert_eq!(api.code, ErrorCode::OverdriveOutOfRange);
    }
}
