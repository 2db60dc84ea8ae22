//! Command arbitration for Casita Assistant actuators
//!
//! Decides, per device, whether a command from a schedule, a person, an API
//! client or an internal timer takes effect. Automatic control can be blocked
//! for a while after a manual override, repeated writes are debounced, and
//! every command keeps the chain of commands that caused it.

pub mod actuator;
pub mod block;
pub mod collision;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod press;
pub mod room;
pub mod timer;

pub use actuator::{ActuatorDebouncer, IgnoreReason, WriteDecision};
pub use block::{BlockAutomaticHandler, BlockOutcome};
pub use collision::{CollisionPolicy, Resolution};
pub use command::{
    BlockRequest, Command, CommandKind, CommandPayload, CommandRecord, CommandSource, Origin,
};
pub use config::{ArbitrationConfig, BlockDefaults, PressTimings};
pub use device::{ActuatorDevice, ActuatorSettings, DeviceStatus, PersistedActuatorState};
pub use error::AutomationError;
pub use press::{PressChannel, PressDebouncer};
pub use room::Room;
pub use timer::{ScheduledTask, TimerToken};
