//! Rooms: named groups of actuators addressed together

use crate::command::{BlockRequest, Command, Origin};
use crate::device::{ActuatorDevice, DeviceStatus};
use crate::error::AutomationError;
use dashmap::DashMap;
use device_core::DeviceId;
use std::sync::Arc;

/// Named set of actuators.
///
/// Fan-out helpers wrap the request in one room-level command and give every
/// device its own child command, dispatched one device at a time. Each device
/// arbitrates on its own; there is no cross-device atomicity.
pub struct Room {
    name: String,
    devices: DashMap<DeviceId, ActuatorDevice>,
}

impl Room {
    #[must_use] pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            devices: DashMap::new(),
        }
    }

    #[must_use] pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a device, replacing any device with the same id
    pub fn add(&self, device: ActuatorDevice) -> Option<ActuatorDevice> {
        let id = device.id();
        tracing::debug!("Adding {} to room {}", id, self.name);
        self.devices.insert(id, device)
    }

    pub fn remove(&self, id: &DeviceId) -> Option<ActuatorDevice> {
        self.devices.remove(id).map(|(_, device)| device)
    }

    #[must_use] pub fn get(&self, id: &DeviceId) -> Option<ActuatorDevice> {
        self.devices.get(id).map(|r| r.value().clone())
    }

    #[must_use] pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use] pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    #[must_use] pub fn statuses(&self) -> Vec<DeviceStatus> {
        self.devices().iter().map(ActuatorDevice::status).collect()
    }

    /// Dispatch a command to one device of the room
    pub fn dispatch(&self, id: &DeviceId, command: impl Into<Arc<Command>>) -> Result<(), AutomationError> {
        let device = self
            .get(id)
            .ok_or_else(|| AutomationError::DeviceNotFound(id.clone()))?;
        device.try_handle(command)
    }

    /// Switch every device on or off. Returns the room-level command.
    pub fn set_all(&self, source: impl Into<Origin>, on: bool, reason: impl Into<String>) -> Arc<Command> {
        let parent = Arc::new(Command::room_set_all(source, on, reason));
        tracing::info!("Room {}: all devices on={}", self.name, on);
        for device in self.devices() {
            let label = format!("room {}", self.name);
            device.handle(Command::set_actuator_state(&parent, on, label));
        }
        parent
    }

    /// Block automatic control on every device
    pub fn block_all(
        &self,
        source: impl Into<Origin>,
        request: BlockRequest,
        reason: impl Into<String>,
    ) -> Arc<Command> {
        let parent = Arc::new(Command::block_automatic(source, request, reason));
        tracing::info!("Room {}: blocking automatic control", self.name);
        for device in self.devices() {
            let label = format!("room {}", self.name);
            device.handle(Command::block_automatic(&parent, request, label));
        }
        parent
    }

    /// Lift the automatic block on every device
    pub fn lift_all(
        &self,
        source: impl Into<Origin>,
        revert_on_lift: Option<bool>,
        reason: impl Into<String>,
    ) -> Arc<Command> {
        let parent = Arc::new(Command::lift_block(source, revert_on_lift, reason));
        tracing::info!("Room {}: lifting automatic block", self.name);
        for device in self.devices() {
            let label = format!("room {}", self.name);
            device.handle(Command::lift_block(&parent, revert_on_lift, label));
        }
        parent
    }

    /// Snapshot of the members, so no map shard stays locked while devices run
    fn devices(&self) -> Vec<ActuatorDevice> {
        self.devices.iter().map(|r| r.value().clone()).collect()
    }
}
