//! Error types for the streaming pipeline.
//!
//! Per-session failures stay contained in their session; nothing in this
//! crate is allowed to take down the host process.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Errors raised by the capture, encode, and transport pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StreamError {
    /// No backend in the codec preference list could be initialized.
    /// Fatal at configure time; the session cannot start.
    #[error("no usable codec backend: {0}")]
    CodecUnavailable(String),

    /// The encoder backend stopped producing output. Recoverable via a
    /// backend restart; escalates to session-fatal when it repeats.
    #[error("encoder produced no output for {0} consecutive submissions")]
    EncoderStalled(u32),

    /// A backend rejected or failed to process a frame.
    #[error("encoding error: {0}")]
    EncodingError(String),

    /// A reliable control-channel send did not go through.
    /// Non-fatal; retried a bounded number of times, then dropped.
    #[error("control delivery failed: {0}")]
    ControlDeliveryFailed(String),

    /// The peer connection was lost or could not be established.
    #[error("transport failed: {0}")]
    TransportFailed(String),

    /// ICE negotiation failed for the session.
    #[error("ICE failed: {0}")]
    IceFailed(String),

    /// An operation was attempted in a session state that does not allow it.
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// The session is closing or closed; no further traffic is accepted.
    #[error("session closed")]
    SessionClosed,

    /// A negotiation primitive (SDP, candidate) was malformed or rejected.
    #[error("negotiation error: {0}")]
    NegotiationError(String),

    /// Configuration could not be loaded, saved, or validated.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A wire-format invariant was violated while encoding or decoding.
    #[error("wire format error: {0}")]
    WireFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StreamError::CodecUnavailable("no backends compiled".to_string());
        assert!(err.to_string().contains("no backends compiled"));

        let err = StreamError::EncoderStalled(5);
        assert!(err.to_string().contains('5'));
    }

    #[test]
    fn test_errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StreamError>();
    }
}
