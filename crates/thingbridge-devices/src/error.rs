//! Driver and transport errors.

use thingbridge_core::Error as CoreError;

/// Errors raised while talking to the broker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Subscribe to {pattern} failed: {reason}")]
    SubscribeFailed { pattern: String, reason: String },

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
}

/// Errors raised by a driver's `set_value`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    /// The blueprint does not say how to encode this feature.
    #[error("No encoding for feature {feature} of model {model}")]
    MissingEncoding { model: String, feature: String },

    #[error("Cannot encode value for {feature}: {reason}")]
    Encoding { feature: String, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<TransportError> for CoreError {
    fn from(e: TransportError) -> Self {
        CoreError::Transport(e.to_string())
    }
}

impl From<DriverError> for CoreError {
    fn from(e: DriverError) -> Self {
        CoreError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_errors_are_retryable_transport_failures() {
        let err: CoreError = DriverError::Transport(TransportError::NotConnected).into();
        assert!(matches!(err, CoreError::Transport(_)));
        assert!(err.is_retryable());

        let missing: CoreError = DriverError::MissingEncoding {
            model: "BULB".into(),
            feature: "color".into(),
        }
        .into();
        assert!(missing.to_string().contains("color"));
    }
}
