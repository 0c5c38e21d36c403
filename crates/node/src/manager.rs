//! Connection manager: the node's context object.
//!
//! Owns the configuration, the frozen dispatcher, the transport, the hash
//! pool and one [`Connection`] per peer. The host feeds transport events in
//! through [`ConnectionManager::on_receive`],
//! [`ConnectionManager::on_transport_connected`] and
//! [`ConnectionManager::on_transport_failed`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wolpertinger_protocol::{Envelope, TrustLevel};

use crate::components::auth::{
    self, AuthClient, HandshakeCredentials, HandshakeError, HandshakeReport,
};
use crate::components::{core, fileshare};
use crate::config::{Config, ConfigError};
use crate::connection::{CallError, Connection, ConnectionState, ResetMode};
use crate::hashing::HashPool;
use crate::registry::{ComponentRegistry, Dispatcher, RegistryError};
use crate::transport::{InboundFrame, PeerId, Transport};

/// Errors raised while building a node.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A component failed to register.
    #[error("component registration failed: {0}")]
    Registry(#[from] RegistryError),
}

/// Per-node connection registry and lifecycle driver.
pub struct ConnectionManager {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn Transport>,
    credentials: HandshakeCredentials,
    hash_pool: Arc<HashPool>,
    connections: DashMap<PeerId, Arc<Connection>>,
    heartbeats: DashMap<PeerId, CancellationToken>,
    shutdown_token: CancellationToken,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local", &self.transport.local_peer())
            .field("connections", &self.connections.len())
            .field("heartbeats", &self.heartbeats.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Builds a node with the built-in components.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self, ManagerError> {
        Self::with_components(config, transport, |_| Ok(()))
    }

    /// Builds a node with the built-in components plus whatever `extend` registers.
    pub fn with_components<F>(
        config: Config,
        transport: Arc<dyn Transport>,
        extend: F,
    ) -> Result<Self, ManagerError>
    where
        F: FnOnce(&mut ComponentRegistry) -> Result<(), RegistryError>,
    {
        config.validate()?;
        let policy = Arc::new(config.security.auth_policy()?);
        let credentials = config.security.handshake_credentials()?;
        let hash_pool = Arc::new(HashPool::new(config.hashing.workers));

        let mut registry = ComponentRegistry::new();
        core::register(&mut registry)?;
        auth::register(&mut registry, policy)?;
        fileshare::register(&mut registry, Arc::clone(&hash_pool))?;
        extend(&mut registry)?;
        let dispatcher = Arc::new(registry.into_dispatcher());

        info!(
            node = %transport.local_peer(),
            components = ?dispatcher.component_names(),
            "Node initialised"
        );

        Ok(Self {
            config,
            dispatcher,
            transport,
            credentials,
            hash_pool,
            connections: DashMap::new(),
            heartbeats: DashMap::new(),
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Address of this node.
    pub fn local_peer(&self) -> &str {
        self.transport.local_peer()
    }

    /// Configuration in effect.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared dispatch table.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The node's hashing pool.
    pub fn hash_pool(&self) -> &Arc<HashPool> {
        &self.hash_pool
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Existing connection to `peer`.
    pub fn connection(&self, peer: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(peer)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Peers with a connection entry.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.connections.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    fn new_connection(&self, peer: &str) -> Arc<Connection> {
        Arc::new(Connection::new(
            peer,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.transport),
            self.config.connection.settings(),
        ))
    }

    fn connection_or_insert(&self, peer: &str) -> Arc<Connection> {
        let entry = self.connections.entry(peer.to_string()).or_insert_with(|| {
            debug!(peer, "Creating connection");
            self.new_connection(peer)
        });
        Arc::clone(entry.value())
    }

    /// Opens an outbound connection to `peer`.
    ///
    /// Marks the peer as solicited, so its own `EstablishConnection` is
    /// admitted regardless of the unsolicited-peer policy.
    pub fn connect(&self, peer: &str) -> Arc<Connection> {
        let connection = self.connection_or_insert(peer);
        connection.session().mark_solicited();
        connection.open();
        info!(peer, "Connecting");
        connection
    }

    /// Connects to `peer`, runs the handshake with the configured credentials
    /// and starts heartbeats.
    pub async fn connect_and_authenticate(
        &self,
        peer: &str,
    ) -> Result<(Arc<Connection>, HandshakeReport), HandshakeError> {
        let connection = self.connect(peer);
        let report = AuthClient::new(&connection)
            .handshake(&self.credentials)
            .await?;
        self.start_heartbeat(peer);
        Ok((connection, report))
    }

    /// Feeds one inbound frame from `peer`.
    ///
    /// Only a well-formed Call opens a relationship with an unknown peer.
    /// Anything else from an unknown peer is handled by a throwaway
    /// connection, which can still answer a malformed call but leaves no
    /// entry behind.
    pub fn on_receive(&self, peer: &str, text: &str) {
        let decoded = Envelope::from_text(text);
        let connection = match (&decoded, self.connection(peer)) {
            (_, Some(connection)) => connection,
            (Ok(Envelope::Call(_)), None) => self.connection_or_insert(peer),
            (_, None) => {
                debug!(peer, "Frame from unknown peer handled without a connection");
                self.new_connection(peer)
            }
        };
        connection.handle(decoded);
    }

    /// The transport reports a link to `peer`.
    pub fn on_transport_connected(&self, peer: &str) {
        self.connection_or_insert(peer).open();
    }

    /// The transport lost `peer`; local state is dropped without notifying it.
    pub async fn on_transport_failed(&self, peer: &str, reason: &str) {
        warn!(peer, reason, "Transport failed");
        self.stop_heartbeat(peer);
        if let Some((_, connection)) = self.connections.remove(peer) {
            connection.reset(ResetMode::Silent).await;
        }
    }

    /// Closes the connection to `peer`, telling it first.
    pub async fn close(&self, peer: &str) {
        self.stop_heartbeat(peer);
        if let Some((_, connection)) = self.connections.remove(peer) {
            connection.reset(ResetMode::Announce).await;
            info!(peer, "Connection closed");
        }
    }

    /// Drops connections that never got anywhere.
    ///
    /// An entry goes when it is still at trust 0, has no pending calls and no
    /// heartbeat, has been idle for at least `max_idle`, and is either
    /// unsolicited or already disconnected. Returns the number removed.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let before = self.connections.len();
        self.connections.retain(|peer, connection| {
            let stale = connection.trust_level() == TrustLevel::UNAUTHENTICATED
                && connection.pending_count() == 0
                && !self.heartbeats.contains_key(peer)
                && connection.idle_for() >= max_idle
                && (!connection.session().is_solicited()
                    || connection.state() == ConnectionState::Disconnected);
            if stale {
                debug!(peer = %peer, "Pruning idle connection");
            }
            !stale
        });
        let pruned = before.saturating_sub(self.connections.len());
        if pruned > 0 {
            info!(pruned, "Pruned idle connections");
        }
        pruned
    }

    /// Runs [`prune_idle`](Self::prune_idle) every `idle_timeout` until shutdown.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let token = self.shutdown_token.clone();
        let idle_timeout = self.config.connection.idle_timeout();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(idle_timeout);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.prune_idle(idle_timeout);
                    }
                }
            }
            debug!(node = %manager.local_peer(), "Maintenance loop finished");
        })
    }

    /// Starts periodic heartbeats to `peer`, replacing any running ones.
    ///
    /// Returns false if there is no connection to `peer`.
    pub fn start_heartbeat(&self, peer: &str) -> bool {
        let Some(connection) = self.connection(peer) else {
            return false;
        };

        let token = self.shutdown_token.child_token();
        if let Some(previous) = self.heartbeats.insert(peer.to_string(), token.clone()) {
            previous.cancel();
        }

        let interval = self.config.connection.heartbeat_interval();
        let timeout = self.config.connection.heartbeat_timeout();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(peer = %connection.peer(), "Heartbeat stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if !connection.is_connected() {
                            continue;
                        }
                        match connection.heartbeat(timeout).await {
                            Ok(()) => debug!(peer = %connection.peer(), "Heartbeat answered"),
                            Err(CallError::Timeout(_)) => {
                                warn!(peer = %connection.peer(), "Heartbeat missed");
                            }
                            Err(e) => {
                                debug!(peer = %connection.peer(), error = %e, "Heartbeat failed");
                            }
                        }
                    }
                }
            }
        });
        true
    }

    fn stop_heartbeat(&self, peer: &str) {
        if let Some((_, token)) = self.heartbeats.remove(peer) {
            token.cancel();
        }
    }

    /// Whether heartbeats to `peer` are running.
    pub fn has_heartbeat(&self, peer: &str) -> bool {
        self.heartbeats.contains_key(peer)
    }

    /// Drives `frames` into [`on_receive`](Self::on_receive) until shutdown.
    pub fn spawn_inbound(
        self: &Arc<Self>,
        mut frames: UnboundedReceiver<InboundFrame>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let token = self.shutdown_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => manager.on_receive(&frame.from, &frame.text),
                        None => break,
                    },
                }
            }
            debug!(node = %manager.local_peer(), "Inbound loop finished");
        })
    }

    /// Stops heartbeats and maintenance, resets every connection with notice
    /// and stops the hash pool.
    pub async fn shutdown(&self) {
        info!(node = %self.local_peer(), "Shutting down");
        self.shutdown_token.cancel();
        self.heartbeats.clear();

        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.connections.clear();
        for connection in connections {
            connection.reset(ResetMode::Announce).await;
        }

        let pool = Arc::clone(&self.hash_pool);
        if tokio::task::spawn_blocking(move || pool.shutdown()).await.is_err() {
            warn!("Hash pool shutdown task failed");
        }
    }
}
