//! The `Core` component: liveness and connection control.

use tracing::{debug, info};
use wolpertinger_protocol::{IntoValue, TrustLevel};

use super::expect_value;
use crate::connection::{CallError, Connection, ResetMode};
use crate::registry::{handler_fn, ComponentRegistry, Outcome, RegistryError};

/// Component name.
pub const COMPONENT: &str = "Core";
/// Liveness probe, answered with an empty response.
pub const HEARTBEAT: &str = "Heartbeat";
/// Asks the receiver to drop all state for this connection.
pub const RESET_CONNECTION: &str = "ResetConnection";
/// Returns the node's version string.
pub const GET_VERSION: &str = "GetVersion";
/// Returns the trust the receiver grants the caller.
pub const GET_TRUST_LEVEL: &str = "GetTrustLevel";

/// Version reported by `GetVersion`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Registers the `Core` methods.
pub fn register(registry: &mut ComponentRegistry) -> Result<(), RegistryError> {
    registry.register(
        COMPONENT,
        HEARTBEAT,
        TrustLevel::UNAUTHENTICATED,
        handler_fn(|ctx, _params| async move {
            debug!(peer = %ctx.peer, "Heartbeat");
            Ok(Outcome::empty())
        }),
    )?;

    registry.register(
        COMPONENT,
        RESET_CONNECTION,
        TrustLevel::UNAUTHENTICATED,
        handler_fn(|ctx, _params| async move {
            info!(peer = %ctx.peer, "Peer requested connection reset");
            match ctx.connection() {
                Some(connection) => connection.reset(ResetMode::Silent).await,
                None => ctx.session.reset(),
            }
            Ok(Outcome::NoResponse)
        }),
    )?;

    registry.register(
        COMPONENT,
        GET_VERSION,
        TrustLevel::UNAUTHENTICATED,
        handler_fn(|_ctx, _params| async { Ok(Outcome::value(VERSION)) }),
    )?;

    registry.register(
        COMPONENT,
        GET_TRUST_LEVEL,
        TrustLevel::UNAUTHENTICATED,
        handler_fn(|ctx, _params| async move {
            Ok(Outcome::Value(Some(ctx.trust_level().into_value())))
        }),
    )?;

    Ok(())
}

/// Typed client for a peer's `Core` component.
#[derive(Debug, Clone, Copy)]
pub struct CoreClient<'a> {
    connection: &'a Connection,
}

impl<'a> CoreClient<'a> {
    /// Wraps a connection.
    pub fn new(connection: &'a Connection) -> Self {
        Self { connection }
    }

    /// Sends a heartbeat using the connection's default timeout.
    pub async fn heartbeat(&self) -> Result<(), CallError> {
        self.connection
            .heartbeat(self.connection.settings().call_timeout)
            .await
    }

    /// The peer's version string.
    pub async fn version(&self) -> Result<String, CallError> {
        let value = self.connection.call(COMPONENT, GET_VERSION, Vec::new()).await?;
        expect_value(value)
    }

    /// The trust level the peer grants this node.
    pub async fn trust_level(&self) -> Result<TrustLevel, CallError> {
        let value = self
            .connection
            .call(COMPONENT, GET_TRUST_LEVEL, Vec::new())
            .await?;
        expect_value(value)
    }
}
