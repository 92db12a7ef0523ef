//! Error taxonomy for the runtime.
//!
//! - [`BootstrapError`]: registration and startup faults. Fatal; the caller
//!   aborts before any traffic is accepted.
//! - [`InvocationError`]: per-call failures, converted into an error [`Res`]
//!   so callers branch on a value instead of unwinding.
//! - [`TransportError`]: driver-level failures.
//! - [`ProviderError`]: failed provider lookups.
//! - [`ProtocolError`]: malformed envelopes (re-exported from `corebus-core`).

use std::time::Duration;

use corebus_core::Res;

pub use corebus_core::ProtocolError;

/// Fatal registration/startup fault.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("{kind} already registered: {name}")]
    Duplicate { kind: &'static str, name: String },
    #[error("{kind} name must not be empty")]
    InvalidName { kind: &'static str },
    #[error("missing bus driver: {0}")]
    MissingDriver(String),
    #[error("missing bus config")]
    MissingConfig,
    #[error("bus config registered after setup: {0}")]
    Frozen(String),
    #[error("bus not opened")]
    NotOpened,
    #[error("failed to connect bus {config}")]
    Connect {
        config: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to open bus {config}")]
    Open {
        config: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to register subject {subject} on bus {config}")]
    Register {
        config: String,
        subject: String,
        #[source]
        source: TransportError,
    },
}

/// Failure to build a named resource.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider not registered: {0}")]
    NotRegistered(String),
    #[error("build provider failed: {name}: {reason}")]
    Build { name: String, reason: String },
    #[error("provider type mismatch: {name} does not build {expected}")]
    TypeMismatch { name: String, expected: &'static str },
}

/// Driver-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection is already running")]
    AlreadyRunning,
    #[error("connection is not running")]
    NotRunning,
    #[error("invalid bus subject")]
    InvalidSubject,
    #[error("connection is not open")]
    NotConnected,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport failure: {0}")]
    Io(String),
}

/// Per-call failure surfaced to the caller as an error result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bus is not ready")]
    BusNotReady,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl InvocationError {
    /// Stable machine-readable state string carried in the error result.
    #[must_use]
    pub fn state(&self) -> &'static str {
        match self {
            InvocationError::NotFound(_) => "invoke.not_found",
            InvocationError::BusNotReady => "bus.not_ready",
            InvocationError::Transport(TransportError::Timeout(_)) => "bus.timeout",
            InvocationError::Transport(_) => "bus.transport",
            InvocationError::Protocol(_) => "bus.protocol",
        }
    }
}

impl From<&InvocationError> for Res {
    fn from(err: &InvocationError) -> Self {
        Res::fail(err.state(), err.to_string())
    }
}

impl From<InvocationError> for Res {
    fn from(err: InvocationError) -> Self {
        Res::from(&err)
    }
}
