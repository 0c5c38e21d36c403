//! Per-connection security state.
//!
//! Holds the connection's current trust level together with the handshake
//! material (session key, outstanding challenge tokens). Trust only moves
//! up, through [`SessionState::escalate`], which is crate-private so that
//! only the authentication component can raise it. [`SessionState::reset`]
//! is the only way back down.
//!
//! Trust shares one atomic word with a reset epoch. A handler that captured
//! the epoch before a reset cannot raise trust after it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use wolpertinger_protocol::{AuthToken, SessionKey, TrustLevel};

#[derive(Debug, Default)]
struct HandshakeMaterial {
    session_key: Option<SessionKey>,
    cluster_token: Option<AuthToken>,
    user_token: Option<AuthToken>,
    peer_cluster_verified: bool,
}

const TRUST_BITS: u32 = 8;
const TRUST_MASK: u64 = 0xff;

fn pack(epoch: u64, trust: u8) -> u64 {
    (epoch << TRUST_BITS) | u64::from(trust)
}

fn unpack(word: u64) -> (u64, u8) {
    (word >> TRUST_BITS, (word & TRUST_MASK) as u8)
}

/// Security state of one connection.
#[derive(Debug, Default)]
pub struct SessionState {
    // Reset epoch in the high bits, trust level in the low byte.
    word: AtomicU64,
    material: Mutex<HandshakeMaterial>,
    // Survives reset: it records who opened the relationship.
    solicited: AtomicBool,
}

impl SessionState {
    /// Creates a fresh, unauthenticated session.
    pub fn new() -> Self {
        Self::default()
    }

    fn material(&self) -> MutexGuard<'_, HandshakeMaterial> {
        self.material
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current trust level.
    pub fn trust_level(&self) -> TrustLevel {
        // Only valid levels are ever stored.
        let (_, trust) = unpack(self.word.load(Ordering::SeqCst));
        TrustLevel::new(trust).unwrap_or_default()
    }

    /// Number of resets this session has been through.
    pub fn epoch(&self) -> u64 {
        unpack(self.word.load(Ordering::SeqCst)).0
    }

    /// Raises trust to at least `level`, never lowering it.
    ///
    /// Returns the resulting level.
    pub(crate) fn escalate(&self, level: TrustLevel) -> TrustLevel {
        self.raise(None, level).unwrap_or(TrustLevel::MAXIMUM)
    }

    /// Like [`escalate`](Self::escalate), but only while the session is
    /// still in `epoch`. Returns `None` once a reset has happened since.
    pub(crate) fn escalate_in(&self, epoch: u64, level: TrustLevel) -> Option<TrustLevel> {
        self.raise(Some(epoch), level)
    }

    fn raise(&self, epoch: Option<u64>, level: TrustLevel) -> Option<TrustLevel> {
        let target = level.min(TrustLevel::MAXIMUM).as_u8();
        let mut observed = self.word.load(Ordering::SeqCst);
        loop {
            let (current_epoch, previous) = unpack(observed);
            if epoch.is_some_and(|epoch| epoch != current_epoch) {
                return None;
            }
            if previous >= target {
                return TrustLevel::new(previous).ok();
            }
            match self.word.compare_exchange_weak(
                observed,
                pack(current_epoch, target),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    tracing::info!(from = previous, to = target, "Trust level escalated");
                    return TrustLevel::new(target).ok();
                }
                Err(actual) => observed = actual,
            }
        }
    }

    /// Drops all trust and handshake material and starts a new epoch.
    pub(crate) fn reset(&self) {
        let mut observed = self.word.load(Ordering::SeqCst);
        loop {
            let (epoch, _) = unpack(observed);
            let next = pack(epoch.wrapping_add(1), TrustLevel::UNAUTHENTICATED.as_u8());
            match self
                .word
                .compare_exchange_weak(observed, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => observed = actual,
            }
        }
        *self.material() = HandshakeMaterial::default();
    }

    /// Whether this node asked to connect to the peer.
    pub fn is_solicited(&self) -> bool {
        self.solicited.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_solicited(&self) {
        self.solicited.store(true, Ordering::SeqCst);
    }

    /// The key agreed during key exchange, if any.
    pub fn session_key(&self) -> Option<SessionKey> {
        self.material().session_key.clone()
    }

    pub(crate) fn set_session_key(&self, key: SessionKey) {
        self.material().session_key = Some(key);
    }

    /// Stores the key only while the session is still in `epoch`.
    ///
    /// The epoch is checked under the material lock, and [`reset`](Self::reset)
    /// bumps the epoch before it clears the material, so a stale key never
    /// survives into the next epoch.
    pub(crate) fn set_session_key_in(&self, epoch: u64, key: SessionKey) -> bool {
        let mut material = self.material();
        if self.epoch() != epoch {
            return false;
        }
        material.session_key = Some(key);
        true
    }

    /// Issues a fresh cluster challenge, replacing any outstanding one.
    pub(crate) fn issue_cluster_token(&self) -> AuthToken {
        let token = AuthToken::generate();
        self.material().cluster_token = Some(token.clone());
        token
    }

    /// Consumes the outstanding cluster challenge.
    pub(crate) fn take_cluster_token(&self) -> Option<AuthToken> {
        self.material().cluster_token.take()
    }

    /// Issues a fresh user challenge, replacing any outstanding one.
    pub(crate) fn issue_user_token(&self) -> AuthToken {
        let token = AuthToken::generate();
        self.material().user_token = Some(token.clone());
        token
    }

    /// Consumes the outstanding user challenge.
    pub(crate) fn take_user_token(&self) -> Option<AuthToken> {
        self.material().user_token.take()
    }

    /// Whether the peer has proved cluster membership to us in the reverse direction.
    pub fn peer_cluster_verified(&self) -> bool {
        self.material().peer_cluster_verified
    }

    pub(crate) fn mark_peer_cluster_verified(&self) {
        self.material().peer_cluster_verified = true;
    }
}
