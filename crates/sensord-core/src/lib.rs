//! Core types and traits for the sensord daemon.
//!
//! This crate holds everything the daemon's components agree on without
//! pulling in any I/O: the error taxonomy, sensor id helpers, the capability
//! traits implemented by adaptors, chains, logical sensors and filters, and
//! the sample types that cross the producer/I-O-thread boundary.

pub mod capabilities;
pub mod error;
pub mod idutils;
pub mod sample;

pub use capabilities::{Chain, DeviceAdaptor, Filter, PipelineRef, SensorChannel};
pub use error::{ErrorKind, ManagerError, ManagerResult};
pub use sample::{PipePacket, SessionId, INVALID_SESSION, NO_SESSION};
