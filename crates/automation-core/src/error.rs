//! Error types for the automation core

use device_core::{DeviceId, StoreError};
use thiserror::Error;

/// Errors that can occur in the automation core.
///
/// Arbitration itself never fails: rejected commands carry an ignore reason
/// and malformed input is clamped. These errors cover the surfaces where a
/// caller can act on the failure.
#[derive(Error, Debug)]
pub enum AutomationError {
    /// Device not found in a room
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// Device does not handle this kind of command
    #[error("Unsupported command {kind} for device {device}")]
    Unsupported { device: DeviceId, kind: String },

    /// Settings or state persistence failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// IO error (configuration)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
