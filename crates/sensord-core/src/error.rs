//! Error taxonomy for the sensor manager.
//!
//! Public manager operations report failure through a return value and leave
//! the detailed error behind for the caller to query; errors never propagate
//! as panics. Contract violations (duplicate sessions, negative refcounts,
//! duplicate instances) are asserted instead, because they indicate a bug in
//! the daemon rather than a recoverable condition.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error categories surfaced on the control bus.
///
/// The discriminants are part of the wire contract and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ErrorKind {
    /// Cleared at the start of every public operation.
    NoError = 0,
    /// Control bus unreachable.
    NotConnected = 1,
    /// Bus object registration failed; also plugin load failures.
    CanNotRegisterObject = 2,
    /// Bus service-name claim failed.
    CanNotRegisterService = 3,
    /// Unknown entry id.
    IdNotRegistered = 4,
    /// Entry exists but no factory is registered for its type.
    FactoryNotRegistered = 5,
    /// Release on an absent instance or an unknown session.
    NotInstantiated = 6,
    /// Second control request on an already controlled sensor.
    AlreadyUnderControl = 7,
    /// Adaptor factory succeeded but the adaptor refused to start.
    AdaptorNotStarted = 8,
}

impl ErrorKind {
    /// Numeric code reported over the control bus.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::NoError => "no_error",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::CanNotRegisterObject => "can_not_register_object",
            ErrorKind::CanNotRegisterService => "can_not_register_service",
            ErrorKind::IdNotRegistered => "id_not_registered",
            ErrorKind::FactoryNotRegistered => "factory_not_registered",
            ErrorKind::NotInstantiated => "not_instantiated",
            ErrorKind::AlreadyUnderControl => "already_under_control",
            ErrorKind::AdaptorNotStarted => "adaptor_not_started",
        };
        write!(f, "{}", label)
    }
}

/// A categorized manager error with a human-readable message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ManagerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ManagerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The "no error" state every public operation starts from.
    pub fn none() -> Self {
        Self {
            kind: ErrorKind::NoError,
            message: String::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind != ErrorKind::NoError
    }
}

/// Convenience alias for operations that fail with a [`ManagerError`].
pub type ManagerResult<T> = std::result::Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(ErrorKind::NoError.code(), 0);
        assert_eq!(ErrorKind::IdNotRegistered.code(), 4);
        assert_eq!(ErrorKind::AdaptorNotStarted.code(), 8);
    }

    #[test]
    fn error_display_uses_message() {
        let err = ManagerError::new(ErrorKind::AlreadyUnderControl, "sensor already under control");
        assert_eq!(err.to_string(), "sensor already under control");
        assert!(err.is_error());
        assert!(!ManagerError::none().is_error());
    }
}
