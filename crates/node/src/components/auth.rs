//! The `Authentication` component and the client-side handshake.
//!
//! Handshake steps, each an ordinary call:
//!
//! 1. `EstablishConnection` - admission policy, trust 0 -> 1
//! 2. `KeyExchange` - ephemeral X25519, both sides derive the session key
//! 3. `GetClusterAuthToken` / `ClusterAuth` - cluster secret, trust -> 2
//! 4. `GetUserAuthToken` / `UserAuth` - admin password, trust -> 3
//!
//! `ProveClusterMembership` lets the initiator check the acceptor the other
//! way round. It needs cluster trust itself, otherwise any admitted peer
//! could use it as an oracle for `ClusterAuth`. Trust level 4 is never
//! granted here.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use wolpertinger_protocol::{
    user_auth_key, AuthToken, ClusterSecret, ErrorCode, KeyExchange, SessionKey, TrustLevel, Value,
};

use super::{core::CoreClient, expect_value};
use crate::connection::{CallError, Connection};
use crate::registry::{handler_fn, param, CallContext, ComponentRegistry, Outcome, RegistryError};

/// Component name.
pub const COMPONENT: &str = "Authentication";
/// Admission request.
pub const ESTABLISH_CONNECTION: &str = "EstablishConnection";
/// Ephemeral key agreement.
pub const KEY_EXCHANGE: &str = "KeyExchange";
/// Issues a cluster challenge.
pub const GET_CLUSTER_AUTH_TOKEN: &str = "GetClusterAuthToken";
/// Answers a cluster challenge.
pub const CLUSTER_AUTH: &str = "ClusterAuth";
/// Computes the cluster key for a caller-chosen token.
pub const PROVE_CLUSTER_MEMBERSHIP: &str = "ProveClusterMembership";
/// Issues a user challenge.
pub const GET_USER_AUTH_TOKEN: &str = "GetUserAuthToken";
/// Answers a user challenge.
pub const USER_AUTH: &str = "UserAuth";

/// Credentials and admission rules of the accepting side.
#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    /// Accept peers this node never asked to connect to.
    pub accept_unsolicited: bool,
    /// Peers always admitted.
    pub allowed_peers: HashSet<String>,
    /// Shared cluster secret; cluster auth fails without one.
    pub cluster_secret: Option<ClusterSecret>,
    /// Password for user auth; user auth fails without one.
    pub admin_password: Option<String>,
}

impl AuthPolicy {
    /// Whether `peer` may open a session.
    pub fn admits(&self, peer: &str, solicited: bool) -> bool {
        solicited || self.accept_unsolicited || self.allowed_peers.contains(peer)
    }
}

/// Registers the `Authentication` methods.
pub fn register(
    registry: &mut ComponentRegistry,
    policy: Arc<AuthPolicy>,
) -> Result<(), RegistryError> {
    let admission = Arc::clone(&policy);
    registry.register(
        COMPONENT,
        ESTABLISH_CONNECTION,
        TrustLevel::UNAUTHENTICATED,
        handler_fn(move |ctx, _params| {
            let admitted = admission.admits(&ctx.peer, ctx.session.is_solicited());
            async move {
                if !admitted {
                    warn!(peer = %ctx.peer, "Refused connection from unsolicited peer");
                    return Err(ErrorCode::NotAuthorized);
                }
                if ctx.escalate(TrustLevel::CONNECTION_ACCEPTED).is_none() {
                    warn!(peer = %ctx.peer, "Connection reset during admission");
                    return Err(ErrorCode::NotAuthorized);
                }
                info!(peer = %ctx.peer, "Connection accepted");
                Ok(Outcome::value(true))
            }
        }),
    )?;

    registry.register(
        COMPONENT,
        KEY_EXCHANGE,
        TrustLevel::CONNECTION_ACCEPTED,
        handler_fn(|ctx, params| async move {
            let peer_public: Vec<u8> = param(&params, 0)?;
            let exchange = KeyExchange::generate();
            let public = exchange.public_key_bytes();
            let key = exchange.complete(&peer_public).map_err(|e| {
                warn!(peer = %ctx.peer, error = %e, "Key exchange failed");
                ErrorCode::EncryptionFailure
            })?;
            let fingerprint = key.fingerprint();
            if !ctx.set_session_key(key) {
                warn!(peer = %ctx.peer, "Connection reset during key exchange");
                return Err(ErrorCode::NotAuthorized);
            }
            debug!(peer = %ctx.peer, fingerprint = %fingerprint, "Session key agreed");
            Ok(Outcome::value(public.to_vec()))
        }),
    )?;

    registry.register(
        COMPONENT,
        GET_CLUSTER_AUTH_TOKEN,
        TrustLevel::CONNECTION_ACCEPTED,
        handler_fn(|ctx, _params| async move {
            let token = ctx.session.issue_cluster_token();
            Ok(Outcome::value(token.as_str()))
        }),
    )?;

    let cluster = Arc::clone(&policy);
    registry.register(
        COMPONENT,
        CLUSTER_AUTH,
        TrustLevel::CONNECTION_ACCEPTED,
        handler_fn(move |ctx, params| {
            let secret = cluster.cluster_secret.clone();
            async move {
                let key: String = param(&params, 0)?;
                // Consumed whatever the outcome.
                let token = ctx.session.take_cluster_token();
                let verified = match (secret, token) {
                    (Some(secret), Some(token)) => secret.auth_key(&token).verify(&key),
                    _ => false,
                };
                grant(&ctx, verified, TrustLevel::CLUSTER_VERIFIED, "cluster")
            }
        }),
    )?;

    let prover = Arc::clone(&policy);
    registry.register(
        COMPONENT,
        PROVE_CLUSTER_MEMBERSHIP,
        TrustLevel::CLUSTER_VERIFIED,
        handler_fn(move |_ctx, params| {
            let secret = prover.cluster_secret.clone();
            async move {
                let token: String = param(&params, 0)?;
                let secret = secret.ok_or(ErrorCode::NotAuthorized)?;
                let key = secret.auth_key(&AuthToken::from_string(token));
                Ok(Outcome::value(key.as_str()))
            }
        }),
    )?;

    registry.register(
        COMPONENT,
        GET_USER_AUTH_TOKEN,
        TrustLevel::CLUSTER_VERIFIED,
        handler_fn(|ctx, _params| async move {
            let token = ctx.session.issue_user_token();
            Ok(Outcome::value(token.as_str()))
        }),
    )?;

    registry.register(
        COMPONENT,
        USER_AUTH,
        TrustLevel::CLUSTER_VERIFIED,
        handler_fn(move |ctx, params| {
            let password = policy.admin_password.clone();
            async move {
                let key: String = param(&params, 0)?;
                let token = ctx.session.take_user_token();
                let verified = match (password, token) {
                    (Some(password), Some(token)) => {
                        user_auth_key(token.as_str(), &password).verify(&key)
                    }
                    _ => false,
                };
                grant(&ctx, verified, TrustLevel::USER_VERIFIED, "user")
            }
        }),
    )?;

    Ok(())
}

fn grant(
    ctx: &CallContext,
    verified: bool,
    level: TrustLevel,
    step: &str,
) -> Result<Outcome, ErrorCode> {
    if !verified {
        warn!(peer = %ctx.peer, step, "Authentication failed");
        return Err(ErrorCode::NotAuthorized);
    }
    if ctx.escalate(level).is_none() {
        warn!(peer = %ctx.peer, step, "Connection reset during authentication");
        return Err(ErrorCode::NotAuthorized);
    }
    info!(peer = %ctx.peer, step, trust = %level, "Authentication succeeded");
    Ok(Outcome::value(true))
}

/// What the initiator brings to a handshake.
#[derive(Debug, Clone, Default)]
pub struct HandshakeCredentials {
    /// Cluster secret; cluster auth is skipped without one.
    pub cluster_secret: Option<ClusterSecret>,
    /// Admin password of the peer; user auth is skipped without one.
    pub password: Option<String>,
    /// Also require the peer to prove cluster membership.
    pub verify_peer: bool,
}

/// Result of a completed handshake.
#[derive(Debug, Clone)]
pub struct HandshakeReport {
    /// Key agreed during key exchange.
    pub session_key: SessionKey,
    /// The peer accepted our cluster key.
    pub cluster_verified: bool,
    /// The peer proved cluster membership to us.
    pub peer_cluster_verified: bool,
    /// The peer accepted our user key.
    pub user_verified: bool,
    /// Trust the peer grants us at the end of the handshake.
    pub remote_trust: TrustLevel,
}

/// Handshake failures.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The peer refused to open a session.
    #[error("peer refused the connection")]
    Refused,

    /// The peer rejected a challenge answer.
    #[error("{0} authentication rejected by peer")]
    Rejected(&'static str),

    /// The peer could not prove cluster membership.
    #[error("peer failed to prove cluster membership")]
    PeerNotInCluster,

    /// A handshake call failed.
    #[error(transparent)]
    Call(#[from] CallError),
}

fn rejected_as(step: &'static str, err: CallError) -> HandshakeError {
    match err.remote_code() {
        Some(ErrorCode::NotAuthorized) => HandshakeError::Rejected(step),
        _ => HandshakeError::Call(err),
    }
}

/// Typed client for a peer's `Authentication` component.
#[derive(Debug, Clone, Copy)]
pub struct AuthClient<'a> {
    connection: &'a Connection,
}

impl<'a> AuthClient<'a> {
    /// Wraps a connection.
    pub fn new(connection: &'a Connection) -> Self {
        Self { connection }
    }

    /// Asks the peer to accept a session.
    ///
    /// On success this side also treats the connection as accepted.
    pub async fn establish(&self) -> Result<(), HandshakeError> {
        let value = self
            .connection
            .call(COMPONENT, ESTABLISH_CONNECTION, Vec::new())
            .await
            .map_err(|e| match e.remote_code() {
                Some(ErrorCode::NotAuthorized) => HandshakeError::Refused,
                _ => HandshakeError::Call(e),
            })?;
        if !expect_value::<bool>(value)? {
            return Err(HandshakeError::Refused);
        }
        self.connection
            .session()
            .escalate(TrustLevel::CONNECTION_ACCEPTED);
        Ok(())
    }

    /// Runs the key exchange and stores the agreed key in the local session.
    pub async fn key_exchange(&self) -> Result<SessionKey, CallError> {
        let exchange = KeyExchange::generate();
        let public = exchange.public_key_bytes().to_vec();
        let value = self
            .connection
            .call(COMPONENT, KEY_EXCHANGE, vec![Value::Bytes(public)])
            .await?;
        let peer_public: Vec<u8> = expect_value(value)?;
        let key = exchange.complete(&peer_public)?;
        self.connection.session().set_session_key(key.clone());
        Ok(key)
    }

    /// Proves cluster membership to the peer.
    pub async fn cluster_auth(&self, secret: &ClusterSecret) -> Result<(), HandshakeError> {
        let value = self
            .connection
            .call(COMPONENT, GET_CLUSTER_AUTH_TOKEN, Vec::new())
            .await?;
        let token = AuthToken::from_string(expect_value::<String>(value)?);
        let key = secret.auth_key(&token);
        self.connection
            .call(COMPONENT, CLUSTER_AUTH, vec![Value::Text(key.as_str().to_string())])
            .await
            .map_err(|e| rejected_as("cluster", e))?;
        Ok(())
    }

    /// Challenges the peer to prove cluster membership.
    ///
    /// On success the peer is granted cluster trust on this side.
    pub async fn verify_peer_cluster(&self, secret: &ClusterSecret) -> Result<bool, CallError> {
        let token = AuthToken::generate();
        let value = self
            .connection
            .call(
                COMPONENT,
                PROVE_CLUSTER_MEMBERSHIP,
                vec![Value::Text(token.as_str().to_string())],
            )
            .await?;
        let answer: String = expect_value(value)?;
        let verified = secret.auth_key(&token).verify(&answer);
        if verified {
            let session = self.connection.session();
            session.mark_peer_cluster_verified();
            session.escalate(TrustLevel::CLUSTER_VERIFIED);
        } else {
            warn!(
                peer = %self.connection.peer(),
                "Peer answered cluster challenge incorrectly"
            );
        }
        Ok(verified)
    }

    /// Proves knowledge of the peer's admin password.
    pub async fn user_auth(&self, password: &str) -> Result<(), HandshakeError> {
        let value = self
            .connection
            .call(COMPONENT, GET_USER_AUTH_TOKEN, Vec::new())
            .await?;
        let token: String = expect_value(value)?;
        let key = user_auth_key(&token, password);
        self.connection
            .call(COMPONENT, USER_AUTH, vec![Value::Text(key.as_str().to_string())])
            .await
            .map_err(|e| rejected_as("user", e))?;
        Ok(())
    }

    /// Runs every handshake step the credentials allow.
    pub async fn handshake(
        &self,
        credentials: &HandshakeCredentials,
    ) -> Result<HandshakeReport, HandshakeError> {
        self.establish().await?;
        let session_key = self.key_exchange().await?;

        let mut report = HandshakeReport {
            session_key,
            cluster_verified: false,
            peer_cluster_verified: false,
            user_verified: false,
            remote_trust: TrustLevel::CONNECTION_ACCEPTED,
        };

        if let Some(secret) = &credentials.cluster_secret {
            self.cluster_auth(secret).await?;
            report.cluster_verified = true;

            if credentials.verify_peer {
                if !self.verify_peer_cluster(secret).await? {
                    return Err(HandshakeError::PeerNotInCluster);
                }
                report.peer_cluster_verified = true;
            }

            if let Some(password) = &credentials.password {
                self.user_auth(password).await?;
                report.user_verified = true;
            }
        }

        report.remote_trust = CoreClient::new(self.connection).trust_level().await?;
        info!(
            peer = %self.connection.peer(),
            remote_trust = %report.remote_trust,
            fingerprint = %report.session_key.fingerprint(),
            "Handshake complete"
        );
        Ok(report)
    }
}
