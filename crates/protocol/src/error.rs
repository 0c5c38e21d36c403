//! Error types for the protocol crate.

use thiserror::Error;
use uuid::Uuid;

use crate::messages::{EnvelopeKind, ErrorCode};

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Envelope errors
    /// The frame was not a valid envelope.
    ///
    /// Carries whatever addressing could be salvaged from the raw frame so the
    /// receiver can still answer with an Error envelope.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        /// Message kind named by the frame's root, if recognisable.
        kind: Option<EnvelopeKind>,
        /// CallId recovered from the raw frame, if any.
        call_id: Option<Uuid>,
        /// Component name recovered from the raw frame, if any.
        component: Option<String>,
        /// What was wrong with the frame.
        reason: String,
    },

    /// The root of the frame named no known message kind.
    #[error("unknown message kind: {kind}")]
    UnknownMessageKind {
        /// Root key found in the frame.
        kind: String,
        /// CallId recovered from the frame body, if any.
        call_id: Option<Uuid>,
    },

    // Value errors
    /// Attempted to encode a Rust type that has no registered logical name.
    #[error("type not registered: {0}")]
    UnregisteredType(String),

    /// A composite value names a logical type this node does not know.
    #[error("unsupported parameter type: {0}")]
    UnsupportedParameterType(String),

    /// A logical type name was registered twice.
    #[error("type already registered: {0}")]
    DuplicateType(String),

    /// A value did not have the shape the receiver expected.
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        /// Expected value kind.
        expected: String,
        /// Actual value kind.
        got: String,
    },

    // Protocol constants
    /// Trust level outside 0..=4.
    #[error("invalid trust level: {0}")]
    InvalidTrustLevel(u8),

    /// Integer that maps to no error code.
    #[error("invalid error code: {0}")]
    InvalidErrorCode(u16),

    // Cryptographic errors
    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid cluster secret (must be hex).
    #[error("invalid cluster secret: {0}")]
    InvalidClusterSecret(String),
}

impl ProtocolError {
    /// Maps the error to the wire-level error code sent back to a peer.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::MalformedEnvelope { .. } | ProtocolError::Deserialization(_) => {
                ErrorCode::MalformedEnvelope
            }
            ProtocolError::UnknownMessageKind { .. } => ErrorCode::UnknownMessageKind,
            ProtocolError::UnsupportedParameterType(_) | ProtocolError::UnregisteredType(_) => {
                ErrorCode::UnsupportedParameterType
            }
            ProtocolError::TypeMismatch { .. } => ErrorCode::InvalidParameters,
            ProtocolError::InvalidPublicKey(_) => ErrorCode::EncryptionFailure,
            ProtocolError::InvalidErrorCode(_) => ErrorCode::MalformedResponse,
            ProtocolError::Serialization(_)
            | ProtocolError::DuplicateType(_)
            | ProtocolError::InvalidTrustLevel(_)
            | ProtocolError::InvalidClusterSecret(_) => ErrorCode::UnspecifiedError,
        }
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
