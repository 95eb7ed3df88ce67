//! Error types for the drover runtime and backends.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the transport, session and adapter layers.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to establish a connection to the browser endpoint.
    #[error("Failed to connect to browser endpoint: {0}")]
    ConnectionFailed(String),

    /// Transport-level error (socket or pipe communication).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The browser rejected a protocol call.
    #[error("Protocol error ({method}): {message}")]
    Protocol { method: String, message: String },

    /// The target (browser, page or worker) was closed while the call was
    /// pending or before it was sent.
    #[error("Protocol error ({method}): {reason}")]
    TargetClosed { method: String, reason: String },

    /// The target crashed; the session is unusable from now on.
    #[error("Target crashed")]
    TargetCrashed,

    /// The execution context the call was addressed to no longer exists.
    ///
    /// A distinct kind so callers can re-resolve the realm instead of
    /// treating this as a generic failure.
    #[error("Execution context was destroyed")]
    ContextDestroyed,

    /// The frame the call was addressed to has been detached.
    #[error("Frame has been detached")]
    FrameDetached,

    /// The remote evaluation threw a JavaScript exception.
    #[error("Evaluation failed: {0}")]
    JavaScript(String),

    /// A value cannot be serialized for the remote realm.
    #[error("Unserializable value: {0}")]
    Unserializable(String),

    /// Timeout waiting for an operation.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal channel closed unexpectedly.
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

impl Error {
    /// Returns true if this error means the target went away, either before
    /// or while the call was in flight.
    pub fn is_target_closed(&self) -> bool {
        matches!(self, Error::TargetClosed { .. } | Error::TargetCrashed)
    }

    /// Returns true for errors a caller can fix by re-resolving a stale
    /// reference (destroyed context, detached frame).
    pub fn is_stale_reference(&self) -> bool {
        matches!(self, Error::ContextDestroyed | Error::FrameDetached)
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Maps a raw protocol error message onto the stale-reference kinds where
    /// the message is recognizably one of them, otherwise keeps it verbatim.
    pub fn from_protocol(method: &str, message: String) -> Error {
        let lower = message.to_ascii_lowercase();
        if lower.contains("cannot find context")
            || lower.contains("execution context was destroyed")
            || lower.contains("no such realm")
        {
            return Error::ContextDestroyed;
        }
        if lower.contains("frame with the given id was not found")
            || lower.contains("no such frame")
        {
            return Error::FrameDetached;
        }
        Error::Protocol {
            method: method.to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_destroyed_is_recognized() {
        let err = Error::from_protocol(
            "Runtime.evaluate",
            "Cannot find context with specified id".to_string(),
        );
        assert!(err.is_stale_reference());
    }

    #[test]
    fn other_protocol_errors_keep_method_and_message() {
        let err = Error::from_protocol("Page.navigate", "Invalid url".to_string());
        match &err {
            Error::Protocol { method, message } => {
                assert_eq!(method, "Page.navigate");
                assert_eq!(message, "Invalid url");
            }
            other => panic!("expected Protocol, got {other:?}"),
        }
        assert!(!err.is_stale_reference());
    }

    #[test]
    fn target_closed_predicate() {
        let err = Error::TargetClosed {
            method: "Runtime.evaluate".to_string(),
            reason: "Page closed".to_string(),
        };
        assert!(err.is_target_closed());
        assert!(Error::TargetCrashed.is_target_closed());
        assert!(!Error::Timeout("t".into()).is_target_closed());
    }
}
