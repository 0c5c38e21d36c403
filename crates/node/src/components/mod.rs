//! Built-in components.
//!
//! Each submodule exposes a `register` function that adds its methods to a
//! [`ComponentRegistry`](crate::registry::ComponentRegistry), plus a typed
//! client stub for calling the same component on a peer.

pub mod auth;
pub mod core;
pub mod fileshare;

use wolpertinger_protocol::{FromValue, Value};

use crate::connection::CallError;

/// Converts a response value into `T`, treating an absent value as null.
pub(crate) fn expect_value<T: FromValue>(value: Option<Value>) -> Result<T, CallError> {
    T::from_value(value.unwrap_or(Value::Null))
        .map_err(|e| CallError::MalformedResponse(e.to_string()))
}
