//! hive-core — shared types, wire protocol, configuration and errors.
//! All other Hive crates depend on this one.

pub mod config;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use error::CoordError;
pub use types::{Capability, DeviceClass, NodeId, NodeState, TaskId, TaskState};
