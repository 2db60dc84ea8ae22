//! Device collaborator layer
//!
//! This crate provides the interfaces the automation core talks to:
//! device identity, the actuator write primitive, state reports coming back
//! from devices, and JSON file persistence of per-device settings and state.

pub mod device;
pub mod persistence;

pub use device::{
    ActuatorDriver, ChannelDriver, DeviceId, DriverError, StateReport, WriteRequest,
};
pub use persistence::{JsonStore, StoreError};
