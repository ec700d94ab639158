//! Lifecycle notifications surfaced to presentation layers.

use shared::domain::{CallState, EndReason, MediaKind, PeerInfo, SessionId};

use crate::error::CallFailure;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotification {
    IncomingCall {
        session_id: SessionId,
        peer: PeerInfo,
        media_kind: MediaKind,
    },
    StateChanged {
        session_id: SessionId,
        state: CallState,
    },
    CallEnded {
        session_id: SessionId,
        reason: EndReason,
        duration_ms: u64,
        failure: Option<CallFailure>,
    },
}

impl CallNotification {
    pub fn session_id(&self) -> SessionId {
        match self {
            CallNotification::IncomingCall { session_id, .. }
            | CallNotification::StateChanged { session_id, .. }
            | CallNotification::CallEnded { session_id, .. } => *session_id,
        }
    }
}
