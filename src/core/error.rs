//! Error types for the gateway.

use thiserror::Error;

/// Result type alias using [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Unified error type for all gateway operations.
///
/// # Propagation policy
///
/// - `Validation` and `NotFound` are returned synchronously to the caller of
///   the mutating configuration operation; they never reach a polling loop.
/// - `Connection` is confined to the owning polling loop, where it degrades
///   the device to offline and triggers a reconnect with backoff.
/// - `Persistence` means a configuration mutation was **not** durably
///   applied; the store rolls the in-memory change back before returning it.
/// - `Unsupported` leaves a device without a driver; it is logged by the
///   registry, never fatal to the process.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or missing required configuration fields.
    #[error("validation error: {0}")]
    Validation(String),

    /// Reference to an unknown device or tag.
    #[error("not found: {0}")]
    NotFound(String),

    /// Device type not supported by the installed driver factory.
    #[error("unsupported device type: {0}")]
    Unsupported(String),

    /// Driver connect/read/write failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation requires an established connection.
    #[error("not connected")]
    NotConnected,

    /// Snapshot write or load failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Shorthand for a validation error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Shorthand for a not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Check whether this error denotes a missing device/tag.
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
