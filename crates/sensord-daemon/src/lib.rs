//! sensord: a local sensor-multiplexing daemon.
//!
//! One process mediates between hardware/kernel sensor sources and any
//! number of local client processes. Clients obtain control or listen
//! sessions on named logical sensors over the control socket; the daemon
//! lazily builds the pipeline behind each sensor (chains over device
//! adaptors, both reference-counted) and streams every sample to the
//! subscribed sessions over a shared unix socket.
//!
//! Crate layout mirrors the runtime structure: [`manager`] owns the object
//! registry and session protocol, [`events`] runs it on a single I/O thread,
//! [`pump`] carries samples across from producer threads, [`socket`] is the
//! client transport, and [`control`] dispatches bus requests.

pub mod bus;
pub mod config;
pub mod control;
pub mod events;
pub mod manager;
pub mod mock;
pub mod pipelines;
pub mod properties;
pub mod pump;
pub mod socket;

pub use bus::{ControlBus, LocalBus, OBJECT_PATH, SERVICE_NAME};
pub use config::Settings;
pub use events::{ManagerCommand, ManagerEvent};
pub use manager::{ManagerSignal, SensorContext, SensorFactory, SensorManager};
pub use pump::{sample_pump, SampleDrain, SampleWriter};
pub use socket::SocketHandler;
