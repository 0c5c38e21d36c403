//! The `FileShare` example component.
//!
//! Demonstrates a component that hands work to the background
//! [`HashPool`] and awaits the result before answering.

use std::sync::Arc;

use tracing::debug;
use wolpertinger_protocol::{ErrorCode, TrustLevel, Value};

use super::expect_value;
use crate::connection::{CallError, Connection};
use crate::hashing::HashPool;
use crate::queue::Priority;
use crate::registry::{handler_fn, param, ComponentRegistry, Outcome, RegistryError};

/// Component name.
pub const COMPONENT: &str = "FileShare";
/// Hashes a file on the receiving node.
pub const GET_FILE_HASH: &str = "GetFileHash";
/// Number of hash jobs waiting on the receiving node.
pub const QUEUE_LENGTH: &str = "QueueLength";

/// Registers the `FileShare` methods backed by `pool`.
pub fn register(
    registry: &mut ComponentRegistry,
    pool: Arc<HashPool>,
) -> Result<(), RegistryError> {
    let hash_pool = Arc::clone(&pool);
    registry.register(
        COMPONENT,
        GET_FILE_HASH,
        TrustLevel::USER_VERIFIED,
        handler_fn(move |ctx, params| {
            let pool = Arc::clone(&hash_pool);
            async move {
                let path: String = param(&params, 0)?;
                debug!(peer = %ctx.peer, path = %path, "File hash requested");
                match pool.submit(path, Priority::Normal).digest().await {
                    Ok(digest) => Ok(Outcome::value(digest)),
                    Err(e) if e.is_not_found() => Err(ErrorCode::InvalidParameters),
                    Err(_) => Err(ErrorCode::UnspecifiedError),
                }
            }
        }),
    )?;

    registry.register(
        COMPONENT,
        QUEUE_LENGTH,
        TrustLevel::CLUSTER_VERIFIED,
        handler_fn(move |_ctx, _params| {
            let backlog = i64::try_from(pool.backlog()).unwrap_or(i64::MAX);
            async move { Ok(Outcome::value(backlog)) }
        }),
    )?;

    Ok(())
}

/// Typed client for a peer's `FileShare` component.
#[derive(Debug, Clone, Copy)]
pub struct FileShareClient<'a> {
    connection: &'a Connection,
}

impl<'a> FileShareClient<'a> {
    /// Wraps a connection.
    pub fn new(connection: &'a Connection) -> Self {
        Self { connection }
    }

    /// SHA-256 hex digest of `path` on the peer.
    pub async fn file_hash(&self, path: &str) -> Result<String, CallError> {
        let value = self
            .connection
            .call(COMPONENT, GET_FILE_HASH, vec![Value::Text(path.to_string())])
            .await?;
        expect_value(value)
    }

    /// The peer's hash backlog.
    pub async fn queue_length(&self) -> Result<u64, CallError> {
        let value = self.connection.call(COMPONENT, QUEUE_LENGTH, Vec::new()).await?;
        let backlog: i64 = expect_value(value)?;
        u64::try_from(backlog).map_err(|e| CallError::MalformedResponse(e.to_string()))
    }
}
