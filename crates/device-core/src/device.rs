//! Device identity and the actuator driver contract

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Driver errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Write queue full for device {0}")]
    QueueFull(DeviceId),

    #[error("Transport closed for device {0}")]
    Closed(DeviceId),

    #[error("Device unavailable: {0}")]
    Unavailable(DeviceId),
}

/// Stable identifier of a physical device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    #[must_use] pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use] pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-system safe form of the id, used for per-device files
    #[must_use] pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A state report echoed back by a device after it changed (or re-reported) its state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateReport {
    pub device: DeviceId,
    pub on: bool,
}

/// A physical write handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub device: DeviceId,
    pub on: bool,
}

/// Write primitive of an on/off actuator.
///
/// `write_state` only submits the write. Confirmation arrives later through
/// the driver's own update channel as a [`StateReport`]. Implementations must
/// not call back into the owning device from inside `write_state`.
pub trait ActuatorDriver: Send + Sync {
    /// Submit a physical write
    fn write_state(&self, on: bool) -> Result<(), DriverError>;
}

/// Driver that forwards writes to a transport writer task over a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelDriver {
    device: DeviceId,
    write_tx: mpsc::Sender<WriteRequest>,
}

impl ChannelDriver {
    #[must_use] pub fn new(device: DeviceId, write_tx: mpsc::Sender<WriteRequest>) -> Self {
        Self { device, write_tx }
    }

    #[must_use] pub fn device(&self) -> &DeviceId {
        &self.device
    }
}

impl ActuatorDriver for ChannelDriver {
    fn write_state(&self, on: bool) -> Result<(), DriverError> {
        let request = WriteRequest {
            device: self.device.clone(),
            on,
        };
        match self.write_tx.try_send(request) {
            Ok(()) => {
                tracing::debug!("Queued write on={} for {}", on, self.device);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(DriverError::QueueFull(self.device.clone())),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DriverError::Closed(self.device.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_replaces_separators() {
        let id = DeviceId::new("living room/lamp:1");
        assert_eq!(id.file_stem(), "living_room_lamp_1");
    }

    #[tokio::test]
    async fn test_channel_driver_forwards_writes() {
        let (tx, mut rx) = mpsc::channel(4);
        let driver = ChannelDriver::new(DeviceId::new("lamp"), tx);

        driver.write_state(true).unwrap();

        let request = rx.recv().await.unwrap();
        assert_eq!(request.device.as_str(), "lamp");
        assert!(request.on);
    }

    #[tokio::test]
    async fn test_channel_driver_reports_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);
        let driver = ChannelDriver::new(DeviceId::new("lamp"), tx);

        driver.write_state(true).unwrap();
        assert_eq!(
            driver.write_state(false),
            Err(DriverError::QueueFull(DeviceId::new("lamp")))
        );

        drop(rx);
        assert_eq!(
            driver.write_state(false),
            Err(DriverError::Closed(DeviceId::new("lamp")))
        );
    }
}
