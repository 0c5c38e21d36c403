//! One peer relationship: outbound calls, inbound dispatch and teardown.
//!
//! Every outbound call registers a oneshot waiter keyed by its CallId. The
//! inbound path removes the waiter when the matching Response or Error
//! arrives, so each CallId is answered at most once. Inbound Calls are
//! dispatched on spawned tasks and their replies sent back through the
//! transport.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wolpertinger_protocol::{
    Call, Envelope, EnvelopeKind, ErrorCode, ErrorMessage, ProtocolError, TrustLevel, Value,
};

use crate::components::core;
use crate::registry::{CallContext, Dispatcher};
use crate::session::SessionState;
use crate::transport::{PeerId, Transport, TransportError};

/// Default time a blocking call waits for its reply.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on simultaneously pending calls per connection.
pub const DEFAULT_MAX_PENDING: usize = 8192;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not usable for outbound calls.
    Disconnected,
    /// Open, handshake not yet accepted.
    Connecting,
    /// Open and accepted (trust level 1 or above).
    Established,
}

/// How a reset is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Tear down local state only.
    Silent,
    /// Tell the peer first, then tear down.
    Announce,
}

/// Failure of an outbound call as seen by the waiting caller.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// No reply arrived in time.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The connection was reset while the call was pending.
    #[error("connection reset")]
    ConnectionReset,

    /// The peer answered with an Error envelope.
    #[error("remote error from {component}: {code}")]
    Remote {
        /// Component named in the Error envelope.
        component: String,
        /// Reported error code.
        code: ErrorCode,
    },

    /// The connection is not open.
    #[error("not connected")]
    NotConnected,

    /// Too many calls are already waiting for replies.
    #[error("too many pending calls (limit {limit})")]
    TooManyPending {
        /// Configured cap.
        limit: usize,
    },

    /// The transport refused the frame.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The call could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The reply could not be decoded or had an unexpected shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl CallError {
    /// The remote error code, when the peer rejected the call.
    pub fn remote_code(&self) -> Option<ErrorCode> {
        match self {
            CallError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Tunables for outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Timeout used by [`Connection::call`].
    pub call_timeout: Duration,
    /// Maximum number of simultaneously pending calls.
    pub max_pending: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

#[derive(Debug)]
enum Reply {
    Response(Option<Value>),
    Error { component: String, code: ErrorCode },
    Malformed(String),
    Reset,
}

impl Reply {
    fn into_result(self) -> Result<Option<Value>, CallError> {
        match self {
            Reply::Response(value) => Ok(value),
            Reply::Error { component, code } => Err(CallError::Remote { component, code }),
            Reply::Malformed(reason) => Err(CallError::MalformedResponse(reason)),
            Reply::Reset => Err(CallError::ConnectionReset),
        }
    }
}

// Removes the waiter and releases its slot when the calling future
// completes or is dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<Uuid, oneshot::Sender<Reply>>,
    reserved: &'a AtomicUsize,
    call_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.call_id);
        self.reserved.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State of one peer relationship.
pub struct Connection {
    peer: PeerId,
    session: Arc<SessionState>,
    open: AtomicBool,
    last_activity: Mutex<Instant>,
    pending: DashMap<Uuid, oneshot::Sender<Reply>>,
    // Slots held by in-flight blocking calls; bounded by `max_pending`.
    reserved: AtomicUsize,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn Transport>,
    settings: ConnectionSettings,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("trust", &self.trust_level())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a disconnected connection to `peer`.
    pub fn new(
        peer: impl Into<PeerId>,
        dispatcher: Arc<Dispatcher>,
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            peer: peer.into(),
            session: Arc::new(SessionState::new()),
            open: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            pending: DashMap::new(),
            reserved: AtomicUsize::new(0),
            dispatcher,
            transport,
            settings,
        }
    }

    /// The remote peer.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Security state of this connection.
    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    /// Trust this node currently grants the peer.
    pub fn trust_level(&self) -> TrustLevel {
        self.session.trust_level()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        if !self.open.load(Ordering::SeqCst) {
            ConnectionState::Disconnected
        } else if self.trust_level() >= TrustLevel::CONNECTION_ACCEPTED {
            ConnectionState::Established
        } else {
            ConnectionState::Connecting
        }
    }

    /// Whether the handshake has been accepted.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    /// Call settings in effect.
    pub fn settings(&self) -> ConnectionSettings {
        self.settings
    }

    /// Number of calls waiting for replies.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether a waiter for `call_id` is registered.
    pub fn is_pending(&self, call_id: &Uuid) -> bool {
        self.pending.contains_key(call_id)
    }

    /// Time since the last frame was sent or received.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    /// Moves a disconnected connection to [`ConnectionState::Connecting`].
    pub fn open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            info!(peer = %self.peer, "Connection opened");
        }
    }

    fn register_pending(
        &self,
        call_id: Uuid,
    ) -> Result<(oneshot::Receiver<Reply>, PendingGuard<'_>), CallError> {
        if self.state() == ConnectionState::Disconnected {
            return Err(CallError::NotConnected);
        }

        let limit = self.settings.max_pending;
        let reserved = self
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| {
                (held < limit).then_some(held + 1)
            });
        if let Err(held) = reserved {
            warn!(
                peer = %self.peer,
                pending_len = held,
                max_pending = limit,
                "Too many pending calls; refusing new call"
            );
            return Err(CallError::TooManyPending { limit });
        }
        let guard = PendingGuard {
            pending: &self.pending,
            reserved: &self.reserved,
            call_id,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, tx);

        // A reset between the state check and the insert would strand the waiter.
        if self.state() == ConnectionState::Disconnected {
            return Err(CallError::NotConnected);
        }
        Ok((rx, guard))
    }

    /// Calls `component.method` and waits up to the configured timeout.
    pub async fn call(
        &self,
        component: &str,
        method: &str,
        parameters: Vec<Value>,
    ) -> Result<Option<Value>, CallError> {
        self.call_with_timeout(component, method, parameters, self.settings.call_timeout)
            .await
    }

    /// Calls `component.method` and waits up to `timeout` for the reply.
    pub async fn call_with_timeout(
        &self,
        component: &str,
        method: &str,
        parameters: Vec<Value>,
        timeout: Duration,
    ) -> Result<Option<Value>, CallError> {
        let call = Call::new(component, method, parameters);
        let call_id = call.call_id;
        let (rx, _guard) = self.register_pending(call_id)?;

        let text = Envelope::Call(call).to_text()?;
        debug!(peer = %self.peer, component, method, call_id = %call_id, "Sending call");
        self.touch();
        self.transport.send(&self.peer, text).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply.into_result(),
            // Sender dropped without a reply: only happens on teardown.
            Ok(Err(_)) => Err(CallError::ConnectionReset),
            Err(_) => {
                warn!(
                    peer = %self.peer,
                    component,
                    method,
                    call_id = %call_id,
                    ?timeout,
                    "Call timed out"
                );
                Err(CallError::Timeout(timeout))
            }
        }
    }

    /// Sends a call without waiting for anything.
    ///
    /// Returns the CallId used. Failures are logged only.
    pub async fn notify(
        &self,
        component: &str,
        method: &str,
        parameters: Vec<Value>,
        response_expected: bool,
    ) -> Uuid {
        let mut call = Call::new(component, method, parameters);
        call.response_expected = response_expected;
        let call_id = call.call_id;

        match Envelope::Call(call).to_text() {
            Ok(text) => {
                if let Err(e) = self.transport.send(&self.peer, text).await {
                    error!(
                        peer = %self.peer,
                        component,
                        method,
                        error = %e,
                        "Failed to send notification"
                    );
                }
            }
            Err(e) => {
                error!(component, method, error = %e, "Failed to encode notification");
            }
        }
        call_id
    }

    /// Sends `Core.Heartbeat` and waits `timeout` for the answer.
    pub async fn heartbeat(&self, timeout: Duration) -> Result<(), CallError> {
        self.call_with_timeout(core::COMPONENT, core::HEARTBEAT, Vec::new(), timeout)
            .await
            .map(|_| ())
    }

    /// Handles one inbound text frame.
    pub fn on_receive(self: &Arc<Self>, text: &str) {
        self.handle(Envelope::from_text(text));
    }

    /// Handles one inbound frame that has already been decoded.
    pub fn handle(self: &Arc<Self>, decoded: Result<Envelope, ProtocolError>) {
        self.touch();
        match decoded {
            Ok(Envelope::Call(call)) => self.spawn_dispatch(call),
            Ok(Envelope::Response(response)) => {
                self.route_reply(response.call_id, Reply::Response(response.value));
            }
            Ok(Envelope::Error(err)) => match err.call_id {
                Some(call_id) => self.route_reply(
                    call_id,
                    Reply::Error {
                        component: err.component,
                        code: err.code,
                    },
                ),
                None => warn!(
                    peer = %self.peer,
                    component = %err.component,
                    code = %err.code,
                    "Peer reported an error without a CallId"
                ),
            },
            Err(ProtocolError::MalformedEnvelope {
                kind,
                call_id: Some(call_id),
                component,
                reason,
            }) => match kind {
                Some(EnvelopeKind::Call) => {
                    warn!(
                        peer = %self.peer,
                        call_id = %call_id,
                        reason = %reason,
                        "Malformed call"
                    );
                    let reply = ErrorMessage::new(
                        component.unwrap_or_default(),
                        Some(call_id),
                        ErrorCode::MalformedEnvelope,
                    );
                    self.spawn_send(Envelope::Error(reply));
                }
                _ => self.route_reply(call_id, Reply::Malformed(reason)),
            },
            Err(ProtocolError::UnknownMessageKind {
                kind,
                call_id: Some(call_id),
            }) => {
                warn!(peer = %self.peer, call_id = %call_id, kind = %kind, "Unknown message kind");
                let reply = ErrorMessage::new(
                    String::new(),
                    Some(call_id),
                    ErrorCode::UnknownMessageKind,
                );
                self.spawn_send(Envelope::Error(reply));
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Dropping undecodable frame");
            }
        }
    }

    fn route_reply(&self, call_id: Uuid, reply: Reply) {
        match self.pending.remove(&call_id) {
            Some((_, waiter)) => {
                debug!(peer = %self.peer, call_id = %call_id, "Delivered reply to waiter");
                if waiter.send(reply).is_err() {
                    debug!(call_id = %call_id, "Waiter went away before its reply");
                }
            }
            None => {
                warn!(peer = %self.peer, call_id = %call_id, "Dropping reply for unknown CallId");
            }
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, call: Call) {
        // The peer is talking to us, so the relationship is open again.
        self.open();

        let connection = Arc::clone(self);
        tokio::spawn(async move {
            let ctx = CallContext::new(
                connection.peer.clone(),
                call.call_id,
                Arc::clone(&connection.session),
            )
            .with_connection(Arc::downgrade(&connection));
            if let Some(reply) = connection.dispatcher.dispatch(ctx, call).await {
                connection.send_envelope(reply).await;
            }
        });
    }

    fn spawn_send(self: &Arc<Self>, envelope: Envelope) {
        let connection = Arc::clone(self);
        tokio::spawn(async move { connection.send_envelope(envelope).await });
    }

    async fn send_envelope(&self, envelope: Envelope) {
        let text = match envelope.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!(peer = %self.peer, error = %e, "Failed to encode reply");
                return;
            }
        };
        if let Err(e) = self.transport.send(&self.peer, text).await {
            error!(peer = %self.peer, error = %e, "Failed to send reply");
        }
    }

    /// Tears the connection down.
    ///
    /// Every pending call fails with [`CallError::ConnectionReset`] and the
    /// trust level drops to 0.
    pub async fn reset(&self, mode: ResetMode) {
        if mode == ResetMode::Announce && self.state() != ConnectionState::Disconnected {
            self.notify(core::COMPONENT, core::RESET_CONNECTION, Vec::new(), false)
                .await;
        }
        self.reset_local();
    }

    fn reset_local(&self) {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        self.session.reset();

        let call_ids: Vec<Uuid> = self.pending.iter().map(|entry| *entry.key()).collect();
        let failed = call_ids.len();
        for call_id in call_ids {
            if let Some((_, waiter)) = self.pending.remove(&call_id) {
                let _ = waiter.send(Reply::Reset);
            }
        }

        if was_open || failed > 0 {
            info!(peer = %self.peer, failed_calls = failed, "Connection reset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ComponentRegistry;
    use crate::transport::{InboundFrame, MemoryHub};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::task::JoinHandle;

    fn dispatcher() -> Arc<Dispatcher> {
        let mut registry = ComponentRegistry::new();
        core::register(&mut registry).unwrap();
        Arc::new(registry.into_dispatcher())
    }

    fn pump(
        connection: Arc<Connection>,
        mut rx: UnboundedReceiver<InboundFrame>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                connection.on_receive(&frame.text);
            }
        })
    }

    struct Pair {
        alice: Arc<Connection>,
        bob: Arc<Connection>,
    }

    fn pair(settings: ConnectionSettings) -> Pair {
        let hub = MemoryHub::new();
        let (alice_transport, alice_rx) = hub.endpoint("alice");
        let (bob_transport, bob_rx) = hub.endpoint("bob");

        let alice = Arc::new(Connection::new(
            "bob",
            dispatcher(),
            Arc::new(alice_transport),
            settings,
        ));
        let bob = Arc::new(Connection::new(
            "alice",
            dispatcher(),
            Arc::new(bob_transport),
            settings,
        ));
        alice.open();
        bob.open();
        pump(Arc::clone(&alice), alice_rx);
        pump(Arc::clone(&bob), bob_rx);
        Pair { alice, bob }
    }

    #[tokio::test]
    async fn test_new_connection_is_disconnected() {
        let hub = MemoryHub::new();
        let (transport, _rx) = hub.endpoint("alice");
        let connection = Connection::new(
            "bob",
            dispatcher(),
            Arc::new(transport),
            ConnectionSettings::default(),
        );

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        let err = connection.call("Core", "Heartbeat", vec![]).await.unwrap_err();
        assert!(matches!(err, CallError::NotConnected));

        connection.open();
        assert_eq!(connection.state(), ConnectionState::Connecting);
        connection.session().escalate(TrustLevel::CONNECTION_ACCEPTED);
        assert_eq!(connection.state(), ConnectionState::Established);
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_heartbeat_returns_none() {
        let Pair { alice, .. } = pair(ConnectionSettings::default());
        let value = alice.call("Core", "Heartbeat", vec![]).await.unwrap();
        assert_eq!(value, None);
        assert_eq!(alice.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_is_distinct() {
        let Pair { alice, .. } = pair(ConnectionSettings::default());
        let err = alice.call("Core", "DoesNotExist", vec![]).await.unwrap_err();
        match err {
            CallError::Remote { component, code } => {
                assert_eq!(component, "Core");
                assert_eq!(code, ErrorCode::MethodNotFound);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_waiter() {
        let hub = MemoryHub::new();
        let (transport, _alice_rx) = hub.endpoint("alice");
        // Bob's frames are never read.
        let (_bob, _bob_rx) = hub.endpoint("bob");
        let connection = Connection::new(
            "bob",
            dispatcher(),
            Arc::new(transport),
            ConnectionSettings::default(),
        );
        connection.open();

        let started = std::time::Instant::now();
        let err = connection
            .call_with_timeout("Core", "Heartbeat", vec![], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_fails_all_pending() {
        let hub = MemoryHub::new();
        let (transport, _alice_rx) = hub.endpoint("alice");
        let (_bob, _bob_rx) = hub.endpoint("bob");
        let connection = Arc::new(Connection::new(
            "bob",
            dispatcher(),
            Arc::new(transport),
            ConnectionSettings::default(),
        ));
        connection.open();
        connection.session().escalate(TrustLevel::CLUSTER_VERIFIED);

        let calls: Vec<_> = (0..3)
            .map(|_| {
                let connection = Arc::clone(&connection);
                tokio::spawn(async move { connection.call("Core", "Heartbeat", vec![]).await })
            })
            .collect();

        while connection.pending_count() < 3 {
            tokio::task::yield_now().await;
        }

        connection.reset(ResetMode::Silent).await;
        assert_eq!(connection.trust_level(), TrustLevel::UNAUTHENTICATED);
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        for call in calls {
            let result = call.await.unwrap();
            assert!(matches!(result, Err(CallError::ConnectionReset)));
        }
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_cap() {
        let hub = MemoryHub::new();
        let (transport, _alice_rx) = hub.endpoint("alice");
        let (_bob, _bob_rx) = hub.endpoint("bob");
        let settings = ConnectionSettings {
            call_timeout: Duration::from_secs(5),
            max_pending: 1,
        };
        let connection = Arc::new(Connection::new(
            "bob",
            dispatcher(),
            Arc::new(transport),
            settings,
        ));
        connection.open();

        let first = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.call("Core", "Heartbeat", vec![]).await })
        };
        while connection.pending_count() < 1 {
            tokio::task::yield_now().await;
        }

        let err = connection.call("Core", "Heartbeat", vec![]).await.unwrap_err();
        assert!(matches!(err, CallError::TooManyPending { limit: 1 }));

        connection.reset(ResetMode::Silent).await;
        assert!(matches!(first.await.unwrap(), Err(CallError::ConnectionReset)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pending_cap_holds_under_concurrency() {
        let hub = MemoryHub::new();
        let (transport, _alice_rx) = hub.endpoint("alice");
        let (_bob, _bob_rx) = hub.endpoint("bob");
        let settings = ConnectionSettings {
            call_timeout: Duration::from_secs(1),
            max_pending: 4,
        };
        let connection = Arc::new(Connection::new(
            "bob",
            dispatcher(),
            Arc::new(transport),
            settings,
        ));
        connection.open();

        let calls: Vec<_> = (0..32)
            .map(|_| {
                let connection = Arc::clone(&connection);
                tokio::spawn(async move { connection.call("Core", "Heartbeat", vec![]).await })
            })
            .collect();

        let mut timed_out = 0;
        let mut refused = 0;
        for call in calls {
            match call.await.unwrap() {
                Err(CallError::Timeout(_)) => timed_out += 1,
                Err(CallError::TooManyPending { limit: 4 }) => refused += 1,
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert_eq!(timed_out, 4);
        assert_eq!(refused, 28);
        assert_eq!(connection.pending_count(), 0);

        // Every slot was released.
        let err = connection
            .call_with_timeout("Core", "Heartbeat", vec![], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_notify_discards_late_replies() {
        let Pair { alice, .. } = pair(ConnectionSettings::default());

        // Both answers come back (a Response and an Error) with nobody waiting.
        alice.notify("Core", "Heartbeat", vec![], true).await;
        alice.notify("Nope", "X", vec![], true).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(alice.pending_count(), 0);
        assert_eq!(alice.call("Core", "Heartbeat", vec![]).await.unwrap(), None);
        assert_eq!(alice.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_call_answered_with_error() {
        let hub = MemoryHub::new();
        let (transport, _alice_rx) = hub.endpoint("alice");
        let (_bob, mut bob_rx) = hub.endpoint("bob");
        let connection = Arc::new(Connection::new(
            "bob",
            dispatcher(),
            Arc::new(transport),
            ConnectionSettings::default(),
        ));

        let call_id = Uuid::new_v4();
        let frame = serde_json::json!({
            "call": { "component": "Core", "call_id": call_id.to_string() }
        })
        .to_string();
        connection.on_receive(&frame);

        let reply = bob_rx.recv().await.unwrap();
        match Envelope::from_text(&reply.text).unwrap() {
            Envelope::Error(err) => {
                assert_eq!(err.call_id, Some(call_id));
                assert_eq!(err.component, "Core");
                assert_eq!(err.code, ErrorCode::MalformedEnvelope);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_kind_answered_with_error() {
        let hub = MemoryHub::new();
        let (transport, _alice_rx) = hub.endpoint("alice");
        let (_bob, mut bob_rx) = hub.endpoint("bob");
        let connection = Arc::new(Connection::new(
            "bob",
            dispatcher(),
            Arc::new(transport),
            ConnectionSettings::default(),
        ));

        let call_id = Uuid::new_v4();
        let frame = serde_json::json!({ "ping": { "call_id": call_id.to_string() } }).to_string();
        connection.on_receive(&frame);

        let reply = bob_rx.recv().await.unwrap();
        match Envelope::from_text(&reply.text).unwrap() {
            Envelope::Error(err) => {
                assert_eq!(err.call_id, Some(call_id));
                assert_eq!(err.code, ErrorCode::UnknownMessageKind);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_garbage_and_unmatched_frames_are_dropped() {
        let Pair { alice, .. } = pair(ConnectionSettings::default());

        alice.on_receive("not json at all");
        alice.on_receive(r#"{"ping": {}}"#);
        let stray = Call::new("Core", "Heartbeat", vec![]);
        let response = wolpertinger_protocol::Response::for_call(&stray, None);
        alice.on_receive(&Envelope::Response(response).to_text().unwrap());

        // Still fully usable afterwards.
        assert_eq!(alice.call("Core", "Heartbeat", vec![]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_response_fails_waiter() {
        let hub = MemoryHub::new();
        let (transport, _alice_rx) = hub.endpoint("alice");
        let (_bob, mut bob_rx) = hub.endpoint("bob");
        let connection = Arc::new(Connection::new(
            "bob",
            dispatcher(),
            Arc::new(transport),
            ConnectionSettings::default(),
        ));
        connection.open();

        let call = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.call("Core", "GetVersion", vec![]).await })
        };

        let sent = bob_rx.recv().await.unwrap();
        let call_id = Envelope::from_text(&sent.text).unwrap().call_id().unwrap();
        let bogus = serde_json::json!({
            "response": { "target": "Core", "call_id": call_id.to_string(), "value": 12 }
        })
        .to_string();
        connection.on_receive(&bogus);

        assert!(matches!(
            call.await.unwrap(),
            Err(CallError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_announced_reset_reaches_peer() {
        let Pair { alice, bob } = pair(ConnectionSettings::default());
        bob.session().escalate(TrustLevel::CLUSTER_VERIFIED);

        alice.reset(ResetMode::Announce).await;
        assert_eq!(alice.state(), ConnectionState::Disconnected);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while bob.trust_level() != TrustLevel::UNAUTHENTICATED {
            assert!(std::time::Instant::now() < deadline, "peer never reset");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bob.state(), ConnectionState::Disconnected);
    }
}
