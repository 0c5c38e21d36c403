//! # Wolpertinger Protocol Library
//!
//! This crate provides the envelope definitions, value model and
//! authentication primitives for the Wolpertinger peer-to-peer RPC protocol.
//!
//! ## Overview
//!
//! - **Envelopes**: the three message kinds (call, response, error) and their
//!   JSON text encoding
//! - **Values**: typed call parameters and a registry for composite types
//! - **Trust levels**: the 0–4 scale gating remote methods
//! - **Crypto**: ephemeral key exchange and cluster/user challenge keys
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Components / typed stubs         │
//! ├─────────────────────────────────────────┤
//! │    Envelopes (Call/Response/Error)      │  JSON text
//! ├─────────────────────────────────────────┤
//! │   Text transport (one frame = one msg)  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use wolpertinger_protocol::{Call, Envelope, Value};
//!
//! let call = Call::new("Core", "Heartbeat", vec![]);
//! let text = Envelope::Call(call.clone()).to_text().unwrap();
//!
//! match Envelope::from_text(&text).unwrap() {
//!     Envelope::Call(decoded) => assert_eq!(decoded, call),
//!     _ => unreachable!(),
//! }
//! # let _ = Value::Null;
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Envelope definitions and error codes
//! - [`value`]: Typed values and the composite type registry
//! - [`trust`]: Trust levels
//! - [`crypto`]: Key exchange and authentication keys
//! - [`error`]: Error types

pub mod crypto;
pub mod error;
pub mod messages;
pub mod trust;
pub mod value;

pub use crypto::{
    cluster_auth_key, user_auth_key, AuthKey, AuthToken, ClusterSecret, KeyExchange, SessionKey,
    PUBLIC_KEY_LENGTH,
};
pub use error::{ProtocolError, Result};
pub use messages::{Call, Envelope, EnvelopeKind, ErrorCategory, ErrorCode, ErrorMessage, Response};
pub use trust::TrustLevel;
pub use value::{FromValue, IntoValue, TypeRegistry, Value};
