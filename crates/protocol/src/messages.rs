//! Envelope definitions for Wolpertinger.
//!
//! Three message kinds travel between peers: a [`Call`] invoking a method on
//! a component, a [`Response`] carrying its result, and an [`ErrorMessage`]
//! reporting why it failed. All are serialized as JSON text, one envelope per
//! transport frame, with the kind as the single root key:
//!
//! ```text
//! {"call":     {"component": "Core", "method": "Heartbeat", "call_id": "...", ...}}
//! {"response": {"target": "Core", "call_id": "...", "value": null}}
//! {"error":    {"component": "Core", "call_id": "...", "code": 3004}}
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProtocolError, Result};
use crate::value::Value;

/// Discriminant of the three envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    /// A method invocation.
    Call,
    /// A successful result.
    Response,
    /// A failure report.
    Error,
}

impl EnvelopeKind {
    /// The root key used on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            EnvelopeKind::Call => "call",
            EnvelopeKind::Response => "response",
            EnvelopeKind::Error => "error",
        }
    }

    fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "call" => Some(EnvelopeKind::Call),
            "response" => Some(EnvelopeKind::Response),
            "error" => Some(EnvelopeKind::Error),
            _ => None,
        }
    }
}

/// Top-level envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Envelope {
    /// Method invocation.
    Call(Call),
    /// Successful result of a call.
    Response(Response),
    /// Failure of a call.
    Error(ErrorMessage),
}

/// A method invocation on a remote component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Call {
    /// Component the method belongs to.
    pub component: String,
    /// Method name within the component.
    pub method: String,
    /// Correlation id, unique among the caller's pending calls.
    pub call_id: Uuid,
    /// Positional parameters.
    #[serde(default)]
    pub parameters: Vec<Value>,
    /// Whether the caller wants a Response or Error back.
    #[serde(default = "default_response_expected")]
    pub response_expected: bool,
}

fn default_response_expected() -> bool {
    true
}

impl Call {
    /// Creates a call with a fresh CallId that expects a response.
    pub fn new(
        component: impl Into<String>,
        method: impl Into<String>,
        parameters: Vec<Value>,
    ) -> Self {
        Self {
            component: component.into(),
            method: method.into(),
            call_id: Uuid::new_v4(),
            parameters,
            response_expected: true,
        }
    }

    /// Marks the call as not expecting any reply.
    pub fn without_response(mut self) -> Self {
        self.response_expected = false;
        self
    }
}

/// Successful result of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Response {
    /// Component the response belongs to.
    pub target: String,
    /// CallId of the originating call.
    pub call_id: Uuid,
    /// Returned value, if any.
    #[serde(default)]
    pub value: Option<Value>,
}

impl Response {
    /// Builds the response to `call`.
    pub fn for_call(call: &Call, value: Option<Value>) -> Self {
        Self {
            target: call.component.clone(),
            call_id: call.call_id,
            value,
        }
    }
}

/// Failure report for a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorMessage {
    /// Component the failed call addressed.
    pub component: String,
    /// CallId of the failed call; absent when it could not be recovered.
    #[serde(default)]
    pub call_id: Option<Uuid>,
    /// What went wrong.
    pub code: ErrorCode,
}

impl ErrorMessage {
    /// Creates an error report.
    pub fn new(component: impl Into<String>, call_id: Option<Uuid>, code: ErrorCode) -> Self {
        Self {
            component: component.into(),
            call_id,
            code,
        }
    }

    /// Builds the error reply to `call`.
    pub fn for_call(call: &Call, code: ErrorCode) -> Self {
        Self::new(call.component.clone(), Some(call.call_id), code)
    }
}

// ============================================================================
// Error codes
// ============================================================================

/// Broad grouping of error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Unspecified failures.
    General,
    /// Authorization and cryptography.
    Security,
    /// Problems with an inbound call.
    Request,
    /// Problems with an inbound response.
    Response,
}

/// Error codes carried by [`ErrorMessage`], serialized as integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ErrorCode {
    /// Unknown or unexpected failure, including handler panics.
    UnspecifiedError,
    /// The connection's trust level is below the method's requirement.
    NotAuthorized,
    /// Key exchange or encryption failed.
    EncryptionFailure,
    /// A signature did not verify.
    InvalidSignature,
    /// The frame could not be decoded as an envelope.
    MalformedEnvelope,
    /// The frame's root named no known message kind.
    UnknownMessageKind,
    /// No component with the requested name.
    ComponentNotFound,
    /// The component has no method with the requested name.
    MethodNotFound,
    /// Parameters had the wrong number or shape.
    InvalidParameters,
    /// A composite parameter names an unknown type.
    UnsupportedParameterType,
    /// The response could not be decoded.
    MalformedResponse,
}

impl ErrorCode {
    /// Every defined code.
    pub const ALL: [ErrorCode; 11] = [
        ErrorCode::UnspecifiedError,
        ErrorCode::NotAuthorized,
        ErrorCode::EncryptionFailure,
        ErrorCode::InvalidSignature,
        ErrorCode::MalformedEnvelope,
        ErrorCode::UnknownMessageKind,
        ErrorCode::ComponentNotFound,
        ErrorCode::MethodNotFound,
        ErrorCode::InvalidParameters,
        ErrorCode::UnsupportedParameterType,
        ErrorCode::MalformedResponse,
    ];

    /// Integer code used on the wire.
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::UnspecifiedError => 1000,
            ErrorCode::NotAuthorized => 2001,
            ErrorCode::EncryptionFailure => 2002,
            ErrorCode::InvalidSignature => 2003,
            ErrorCode::MalformedEnvelope => 3001,
            ErrorCode::UnknownMessageKind => 3002,
            ErrorCode::ComponentNotFound => 3003,
            ErrorCode::MethodNotFound => 3004,
            ErrorCode::InvalidParameters => 3005,
            ErrorCode::UnsupportedParameterType => 3006,
            ErrorCode::MalformedResponse => 4001,
        }
    }

    /// Category the code belongs to.
    pub fn category(self) -> ErrorCategory {
        match self.as_u16() / 1000 {
            2 => ErrorCategory::Security,
            3 => ErrorCategory::Request,
            4 => ErrorCategory::Response,
            _ => ErrorCategory::General,
        }
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self> {
        ErrorCode::ALL
            .into_iter()
            .find(|code| code.as_u16() == value)
            .ok_or(ProtocolError::InvalidErrorCode(value))
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code.as_u16()
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.as_u16())
    }
}

// ============================================================================
// Serialization helpers
// ============================================================================

impl Envelope {
    /// Which kind of envelope this is.
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Call(_) => EnvelopeKind::Call,
            Envelope::Response(_) => EnvelopeKind::Response,
            Envelope::Error(_) => EnvelopeKind::Error,
        }
    }

    /// CallId carried by the envelope, if any.
    pub fn call_id(&self) -> Option<Uuid> {
        match self {
            Envelope::Call(call) => Some(call.call_id),
            Envelope::Response(response) => Some(response.call_id),
            Envelope::Error(error) => error.call_id,
        }
    }

    /// Serialize the envelope to JSON text.
    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize an envelope from JSON text.
    ///
    /// Validates the root shape before decoding the body. On failure the
    /// returned [`ProtocolError::MalformedEnvelope`] carries whatever kind,
    /// CallId and component could be salvaged from the raw frame.
    pub fn from_text(text: &str) -> Result<Self> {
        let raw: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::MalformedEnvelope {
                kind: None,
                call_id: None,
                component: None,
                reason: e.to_string(),
            })?;

        let root = match raw.as_object() {
            Some(root) if root.len() == 1 => root,
            _ => {
                return Err(ProtocolError::MalformedEnvelope {
                    kind: None,
                    call_id: None,
                    component: None,
                    reason: "envelope root must be an object with exactly one key".to_string(),
                })
            }
        };

        let (name, body) = root
            .iter()
            .next()
            .ok_or_else(|| ProtocolError::UnknownMessageKind {
                kind: String::new(),
                call_id: None,
            })?;
        let kind = EnvelopeKind::from_wire_name(name).ok_or_else(|| {
            ProtocolError::UnknownMessageKind {
                kind: name.clone(),
                call_id: salvage_call_id(body),
            }
        })?;

        Envelope::deserialize(&raw).map_err(|e| ProtocolError::MalformedEnvelope {
            kind: Some(kind),
            call_id: salvage_call_id(body),
            component: salvage_component(kind, body),
            reason: e.to_string(),
        })
    }
}

fn salvage_call_id(body: &serde_json::Value) -> Option<Uuid> {
    body.get("call_id")
        .and_then(serde_json::Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
}

fn salvage_component(kind: EnvelopeKind, body: &serde_json::Value) -> Option<String> {
    let field = match kind {
        EnvelopeKind::Response => "target",
        EnvelopeKind::Call | EnvelopeKind::Error => "component",
    };
    body.get(field)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}
