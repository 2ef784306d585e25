//! Wire protocol errors.

use thiserror::Error;

/// Errors produced while classifying or decoding wire messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A prefixed frame carried a payload that does not decode.
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload {
        /// Which control message kind failed to decode.
        kind: &'static str,
        /// Decode failure detail.
        reason: String,
    },

    /// JSON decoding of a control message failed.
    #[error("control message decode failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 decoding of an embedded binary payload failed.
    #[error("payload encoding invalid: {0}")]
    Encoding(#[from] base64::DecodeError),
}
