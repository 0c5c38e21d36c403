//! # Wolpertinger Node Library
//!
//! This crate provides the node side of the Wolpertinger peer-to-peer RPC
//! system: remote components, trust-gated dispatch, per-peer connections and
//! the handshake that escalates a session from accepted to user-verified.
//!
//! ## Overview
//!
//! - **Components**: named method tables registered at startup and frozen
//! - **Connections**: outbound calls keyed by CallId, inbound dispatch, reset
//! - **Authentication**: key exchange, cluster challenge and user challenge
//! - **Hashing**: a priority queue feeding a small pool of worker threads
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Connection Manager                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐  ┌────────────┐  ┌───────────────────────┐  │
//! │  │ Connection │  │ Connection │  │   Heartbeat tasks     │  │
//! │  │  (peer A)  │  │  (peer B)  │  │                       │  │
//! │  └─────┬──────┘  └─────┬──────┘  └───────────────────────┘  │
//! │        └───────┬───────┘                                    │
//! │  ┌─────────────▼──────────────────────────────────────────┐ │
//! │  │       Dispatcher (Core, Authentication, FileShare)     │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │                 Transport (text frames)                │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wolpertinger::{Config, ConnectionManager, MemoryHub};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let hub = MemoryHub::new();
//!     let (transport, frames) = hub.endpoint("alpha");
//!
//!     let manager = Arc::new(ConnectionManager::new(Config::default(), Arc::new(transport))?);
//!     manager.spawn_inbound(frames);
//!     manager.spawn_maintenance();
//!
//!     let (connection, report) = manager.connect_and_authenticate("beta").await?;
//!     println!("{} granted trust {}", connection.peer(), report.remote_trust);
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`registry`]: Component registration and trust-gated dispatch
//! - [`connection`]: One peer relationship
//! - [`manager`]: Per-node connection registry and heartbeats
//! - [`components`]: Built-in `Core`, `Authentication` and `FileShare`
//! - [`session`]: Per-connection trust and handshake material
//! - [`transport`]: Transport abstraction and an in-memory hub
//! - [`queue`]: Blocking priority queue
//! - [`hashing`]: File hashing worker pool

pub mod components;
pub mod config;
pub mod connection;
pub mod hashing;
pub mod manager;
pub mod queue;
pub mod registry;
pub mod session;
pub mod transport;

pub use wolpertinger_protocol;

pub use components::auth::{
    AuthClient, AuthPolicy, HandshakeCredentials, HandshakeError, HandshakeReport,
};
pub use components::core::CoreClient;
pub use components::fileshare::FileShareClient;
pub use config::{Config, ConfigError};
pub use connection::{CallError, Connection, ConnectionSettings, ConnectionState, ResetMode};
pub use hashing::{HashError, HashPool};
pub use manager::{ConnectionManager, ManagerError};
pub use queue::{Priority, PriorityQueue};
pub use registry::{
    handler_fn, param, CallContext, ComponentRegistry, Dispatcher, HandlerResult, Outcome,
    RegistryError,
};
pub use session::SessionState;
pub use transport::{InboundFrame, MemoryHub, MemoryTransport, PeerId, Transport, TransportError};
