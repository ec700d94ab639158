use shared::{
    domain::{CallRole, CallState},
    protocol::SignalingMessage,
};

use crate::session::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteVerdict {
    /// Client is free; the invite may ring.
    Admit,
    /// Client already holds a live session; reply `busy`.
    Busy,
    /// Client is dialing the inviter. Reply `busy` and drop the outgoing call
    /// too, so neither side ends up ringing.
    Glare,
    /// The invite repeats a session this client has seen already.
    Duplicate,
}

/// Decides an incoming invite against the registry. Glare (both sides
/// dialing each other) resolves to `Busy` on both ends; there is no
/// tie-break.
pub fn arbitrate_invite(registry: &SessionRegistry, invite: &SignalingMessage) -> InviteVerdict {
    let current = registry.current();
    let repeats_current = current.is_some_and(|session| session.session_id == invite.session_id);
    if repeats_current || registry.was_retired(invite.session_id) {
        return InviteVerdict::Duplicate;
    }
    let dialing_inviter = current.is_some_and(|session| {
        session.role == CallRole::Caller
            && session.state == CallState::Dialing
            && session.peer.user_id == invite.from_user_id
    });
    if dialing_inviter {
        return InviteVerdict::Glare;
    }
    if registry.is_busy() {
        return InviteVerdict::Busy;
    }
    InviteVerdict::Admit
}
