use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use shared::{
    domain::{CallRole, CallState, EndReason, MediaKind, PeerInfo, SessionId},
    protocol::{IceCandidate, SessionDescription},
};

pub const DEFAULT_RETIRED_SESSION_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub session_id: SessionId,
    pub role: CallRole,
    pub peer: PeerInfo,
    pub media_kind: MediaKind,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    /// Remote candidates waiting for a remote description, in receipt order.
    pub pending_candidates: VecDeque<IceCandidate>,
    /// Caller only: the offer prepared while dialing. Its presence means the
    /// invite went out.
    pub(crate) local_offer: Option<SessionDescription>,
    /// Local candidates gathered before the peer accepted.
    pub(crate) outbound_candidates: Vec<IceCandidate>,
    pub(crate) remote_description_applied: bool,
    /// Media was requested from the negotiation engine and must be released.
    pub(crate) media_requested: bool,
    /// Callee only: the user accepted and local media is being prepared.
    pub(crate) accept_requested: bool,
}

impl CallSession {
    pub fn outgoing(
        session_id: SessionId,
        peer: PeerInfo,
        media_kind: MediaKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(session_id, CallRole::Caller, peer, media_kind, CallState::Dialing, now)
    }

    pub fn incoming(
        session_id: SessionId,
        peer: PeerInfo,
        media_kind: MediaKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(session_id, CallRole::Callee, peer, media_kind, CallState::Ringing, now)
    }

    fn new(
        session_id: SessionId,
        role: CallRole,
        peer: PeerInfo,
        media_kind: MediaKind,
        state: CallState,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            role,
            peer,
            media_kind,
            state,
            started_at: now,
            connected_at: None,
            ended_at: None,
            end_reason: None,
            pending_candidates: VecDeque::new(),
            local_offer: None,
            outbound_candidates: Vec::new(),
            remote_description_applied: false,
            media_requested: false,
            accept_requested: false,
        }
    }

    pub fn invite_sent(&self) -> bool {
        self.local_offer.is_some()
    }

    /// Connected time of the call. Zero if media never connected.
    pub fn duration_ms(&self) -> u64 {
        match (self.connected_at, self.ended_at) {
            (Some(connected), Some(ended)) => {
                u64::try_from((ended - connected).num_milliseconds()).unwrap_or(0)
            }
            _ => 0,
        }
    }
}

/// Holds the single live call of a client plus a short memory of ended
/// session ids, so a late message can never revive a finished call.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    active: Option<CallSession>,
    retired: VecDeque<SessionId>,
    retired_capacity: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RETIRED_SESSION_CAPACITY)
    }
}

impl SessionRegistry {
    pub fn new(retired_capacity: usize) -> Self {
        Self {
            active: None,
            retired: VecDeque::with_capacity(retired_capacity),
            retired_capacity: retired_capacity.max(1),
        }
    }

    pub fn current(&self) -> Option<&CallSession> {
        self.active.as_ref()
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut CallSession> {
        self.active.as_mut()
    }

    pub fn state(&self) -> CallState {
        self.active
            .as_ref()
            .map(|session| session.state)
            .unwrap_or(CallState::Idle)
    }

    pub fn is_busy(&self) -> bool {
        self.state().is_live()
    }

    pub fn was_retired(&self, session_id: SessionId) -> bool {
        self.retired.contains(&session_id)
    }

    pub(crate) fn install(&mut self, session: CallSession) {
        debug_assert!(!self.is_busy(), "registry holds at most one live session");
        self.active = Some(session);
    }

    /// Discards the current session and remembers its id.
    pub(crate) fn retire(&mut self) -> Option<CallSession> {
        let session = self.active.take()?;
        if self.retired.len() == self.retired_capacity {
            self.retired.pop_front();
        }
        self.retired.push_back(session.session_id);
        Some(session)
    }
}
