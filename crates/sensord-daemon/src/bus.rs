//! Control-bus seam.
//!
//! The manager registers itself and every live logical sensor on a control
//! bus, and signals error kinds over it. Method-call dispatch on the bus is
//! handled elsewhere (see [`crate::control`]); the manager only needs this
//! narrow registration surface, which also makes the bus trivially mockable
//! in tests.

use std::collections::HashSet;

use sensord_core::ErrorKind;
use tracing::debug;

/// Object path the manager itself is registered under.
pub const OBJECT_PATH: &str = "/SensorManager";

/// Service name claimed on the bus at startup.
pub const SERVICE_NAME: &str = "local.sensord";

/// Registration surface the manager drives.
pub trait ControlBus: Send {
    fn is_connected(&self) -> bool;

    /// Registers an object path; fails with a message when the path is taken.
    fn register_object(&mut self, path: &str) -> Result<(), String>;

    fn unregister_object(&mut self, path: &str);

    fn register_service(&mut self, name: &str) -> Result<(), String>;

    /// Broadcasts an error kind to bus clients.
    fn emit_error(&mut self, kind: ErrorKind);

    /// Concrete-type access for tests and diagnostics.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// In-process bus: tracks registrations and remembers emitted errors.
///
/// This is both the daemon's default bus (dispatch happens over the control
/// socket instead of a system bus) and the recording double the tests
/// observe.
#[derive(Default)]
pub struct LocalBus {
    objects: HashSet<String>,
    service: Option<String>,
    errors: Vec<ErrorKind>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, path: &str) -> bool {
        self.objects.contains(path)
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service.as_deref()
    }

    pub fn emitted_errors(&self) -> &[ErrorKind] {
        &self.errors
    }
}

impl ControlBus for LocalBus {
    fn is_connected(&self) -> bool {
        true
    }

    fn register_object(&mut self, path: &str) -> Result<(), String> {
        if !self.objects.insert(path.to_string()) {
            return Err(format!("object path '{path}' already registered"));
        }
        debug!(path, "bus object registered");
        Ok(())
    }

    fn unregister_object(&mut self, path: &str) {
        self.objects.remove(path);
        debug!(path, "bus object unregistered");
    }

    fn register_service(&mut self, name: &str) -> Result<(), String> {
        if self.service.is_some() {
            return Err(format!("service name '{name}' already claimed"));
        }
        self.service = Some(name.to_string());
        Ok(())
    }

    fn emit_error(&mut self, kind: ErrorKind) {
        self.errors.push(kind);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
