//! Unified error handling for ThingBridge.
//!
//! Provisioning and dispatch return these synchronously to their callers.
//! The reconciler logs and swallows them; the job processor hands them to
//! the work queue so its retry policy can observe them.

/// Unified error type for ThingBridge.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Bad identifiers, codes or request values.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The tenant has no licence left for this model.
    #[error("License quota exceeded for partner {tenant} / model {model}")]
    QuotaExceeded { tenant: String, model: String },

    /// Tenant, model, device or feature does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique code already taken.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Caller does not own the device.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Device is not reporting `online`.
    #[error("Device offline: {0}")]
    DeviceOffline(String),

    /// Driver or broker failed to deliver a value.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Inbound topic or payload could not be parsed.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Relational or state store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Work queue rejected or lost a job.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Generic internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn quota_exceeded(tenant: impl Into<String>, model: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            tenant: tenant.into(),
            model: model.into(),
        }
    }

    /// Whether a background job failing with this error should be retried.
    ///
    /// User-facing errors are final; only infrastructure failures retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Storage(_) | Error::Queue(_))
    }

    /// Short machine-readable code, used in event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Unauthorized(_) => "unauthorized",
            Error::DeviceOffline(_) => "device_offline",
            Error::Transport(_) => "transport_failure",
            Error::MalformedMessage(_) => "malformed_message",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::Queue(_) => "queue",
            Error::Internal(_) => "internal",
        }
    }
}

/// Convenience macros for creating errors.
#[macro_export]
macro_rules! validation_err {
    ($msg:expr) => {
        $crate::error::Error::Validation($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Validation(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! not_found_err {
    ($msg:expr) => {
        $crate::error::Error::NotFound($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::NotFound(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! storage_err {
    ($msg:expr) => {
        $crate::error::Error::Storage($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Storage(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_err {
    ($msg:expr) => {
        $crate::error::Error::Transport($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Transport(format!($fmt, $($arg)*))
    };
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(e.to_string())
    }
}
