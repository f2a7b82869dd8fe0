//! Error types for the heartbeat agent.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Heartbeat(#[from] HeartbeatError),

    #[error("Unknown method '{method}'")]
    UnknownMethod { method: String },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A caller-supplied value was out of bounds. State is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Interval {secs}s is outside the permitted range {min}s..={max}s")]
    IntervalOutOfRange { secs: u64, min: u64, max: u64 },

    #[error("Action name must not be empty")]
    EmptyAction,

    #[error("Route path for action '{action}' must not be empty")]
    EmptyPath { action: String },

    #[error("Invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("Missing argument '{name}'")]
    MissingArgument { name: String },

    #[error("Argument '{name}' must be a non-negative integer, got {value}")]
    InvalidArgument { name: String, value: String },
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },
}

/// Reply correlation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("No reply for request {id} within {after:?}")]
    Timeout { id: u64, after: Duration },

    #[error("Request {id} already has a pending wait")]
    DuplicateRequest { id: u64 },

    #[error("Single-slot correlator already has a pending wait (request {pending})")]
    SlotBusy { pending: u64 },

    #[error("Wait for request {id} was cancelled")]
    Cancelled { id: u64 },
}

/// Outbound send failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to build HTTP client: {reason}")]
    Client { reason: String },

    #[error("Request to {endpoint} failed: {reason}")]
    Request { endpoint: String, reason: String },

    #[error("Request to {endpoint} timed out after {after:?}")]
    Timeout { endpoint: String, after: Duration },

    #[error("{endpoint} returned status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("Failed to read reply from {endpoint}: {reason}")]
    Body { endpoint: String, reason: String },
}

/// Capability registry, health, and repair errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("Capability '{name}' not found")]
    NotFound { name: String },

    #[error("Capability '{name}' is missing and no fallback is registered")]
    NoFallback { name: String },

    #[error("Fallback registered for '{name}' builds a capability named '{actual}'")]
    FallbackNameMismatch { name: String, actual: String },

    #[error("Capability '{name}' probe failed: {reason}")]
    ProbeFailed { name: String, reason: String },

    #[error("Capability '{name}' does not support method '{method}'")]
    Unsupported { name: String, method: String },

    #[error("Capability '{name}' call '{method}' failed: {reason}")]
    CallFailed {
        name: String,
        method: String,
        reason: String,
    },
}

/// Scheduler errors surfaced to callers of the handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeartbeatError {
    #[error("Heartbeat degraded after {attempts} consecutive failed attempts")]
    Degraded { attempts: u32 },

    #[error("Heartbeat scheduler has shut down")]
    Shutdown,
}
