//! Call state machine.
//!
//! [`CallMachine::step`] is the single transition function shared by every
//! client build: it consumes one [`CallInput`] against the
//! [`SessionRegistry`] and returns the [`Effect`]s to execute. It performs no
//! I/O, owns no timers and never awaits.
//!
//! # Inputs
//!
//! - user actions: `Start`, `Accept`, `Reject`, `Cancel`, `Hangup`
//! - relay: `Remote`, `PeerDisconnected`, `PeerUnavailable`
//! - timers: `TimerExpired`
//! - negotiation engine: `Negotiation`
//!
//! An input that does not apply to the current session is ignored and yields
//! no effects.

use std::fmt;

use chrono::{DateTime, Utc};
use shared::{
    domain::{CallRole, CallState, EndReason, MediaKind, PeerInfo, SessionId, UserId},
    protocol::{IceCandidate, SessionDescription, Signal, SignalValidationError, SignalingMessage},
};
use tracing::{debug, info};

use crate::{
    arbiter::{arbitrate_invite, InviteVerdict},
    error::CallFailure,
    events::CallNotification,
    session::{CallSession, SessionRegistry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Ring,
    Negotiation,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKind::Ring => f.write_str("ring"),
            TimerKind::Negotiation => f.write_str("negotiation"),
        }
    }
}

/// Reports from the negotiation engine, always scoped to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    LocalOffer(SessionDescription),
    LocalAnswer(SessionDescription),
    LocalCandidate(IceCandidate),
    /// Callee capture devices are ready after the user accepted.
    MediaReady,
    MediaUnavailable(String),
    Connected,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationCommand {
    /// Acquire local media and produce the caller's offer.
    CreateOffer { media_kind: MediaKind },
    /// Acquire local media for the callee.
    PrepareMedia { media_kind: MediaKind },
    /// Apply the caller's offer and produce a local answer.
    ApplyRemoteOffer(SessionDescription),
    ApplyRemoteAnswer(SessionDescription),
    AddRemoteCandidate(IceCandidate),
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallInput {
    Start {
        session_id: SessionId,
        peer: PeerInfo,
        media_kind: MediaKind,
    },
    Accept,
    Reject,
    Cancel,
    Hangup,
    Remote(SignalingMessage),
    PeerDisconnected(UserId),
    PeerUnavailable {
        session_id: SessionId,
        user_id: UserId,
    },
    TimerExpired {
        session_id: SessionId,
        timer: TimerKind,
    },
    Negotiation {
        session_id: SessionId,
        event: NegotiationEvent,
    },
}

impl CallInput {
    /// Name of the user action, if this input is one.
    pub fn user_action(&self) -> Option<&'static str> {
        match self {
            CallInput::Start { .. } => Some("start a call"),
            CallInput::Accept => Some("accept"),
            CallInput::Reject => Some("reject"),
            CallInput::Cancel => Some("cancel"),
            CallInput::Hangup => Some("hang up"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(SignalingMessage),
    StartTimer {
        session_id: SessionId,
        timer: TimerKind,
    },
    CancelTimer(TimerKind),
    Negotiate {
        session_id: SessionId,
        command: NegotiationCommand,
    },
    Notify(CallNotification),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    NoSession,
    SessionMismatch,
    UnknownSender,
    Misaddressed,
    Duplicate,
    SelfCall,
    Malformed(SignalValidationError),
    NotApplicable(CallState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub effects: Vec<Effect>,
    pub disposition: Disposition,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        self.disposition == Disposition::Applied
    }
}

type Outcome = Result<(), IgnoreReason>;

pub struct CallMachine {
    local: PeerInfo,
}

impl CallMachine {
    pub fn new(local: PeerInfo) -> Self {
        Self { local }
    }

    pub fn local(&self) -> &PeerInfo {
        &self.local
    }

    pub fn step(
        &self,
        registry: &mut SessionRegistry,
        input: CallInput,
        now: DateTime<Utc>,
    ) -> Transition {
        let mut effects = Vec::new();
        let outcome = match input {
            CallInput::Start {
                session_id,
                peer,
                media_kind,
            } => self.start(registry, session_id, peer, media_kind, now, &mut effects),
            CallInput::Accept => self.accept(registry, &mut effects),
            CallInput::Reject => self.reject(registry, now, &mut effects),
            CallInput::Cancel => self.cancel(registry, now, &mut effects),
            CallInput::Hangup => self.hangup(registry, now, &mut effects),
            CallInput::Remote(message) => self.on_remote(registry, message, now, &mut effects),
            CallInput::PeerDisconnected(user_id) => {
                self.on_peer_gone(registry, None, user_id, now, &mut effects)
            }
            CallInput::PeerUnavailable {
                session_id,
                user_id,
            } => self.on_peer_gone(registry, Some(session_id), user_id, now, &mut effects),
            CallInput::TimerExpired { session_id, timer } => {
                self.on_timer(registry, session_id, timer, now, &mut effects)
            }
            CallInput::Negotiation { session_id, event } => {
                self.on_negotiation(registry, session_id, event, now, &mut effects)
            }
        };

        match outcome {
            Ok(()) => Transition {
                effects,
                disposition: Disposition::Applied,
            },
            Err(reason) => {
                debug!(?reason, state = %registry.state(), "call: input ignored");
                Transition {
                    effects: Vec::new(),
                    disposition: Disposition::Ignored(reason),
                }
            }
        }
    }

    fn start(
        &self,
        registry: &mut SessionRegistry,
        session_id: SessionId,
        peer: PeerInfo,
        media_kind: MediaKind,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Outcome {
        if registry.is_busy() {
            return Err(IgnoreReason::NotApplicable(registry.state()));
        }
        if peer.user_id == self.local.user_id {
            return Err(IgnoreReason::SelfCall);
        }

        let mut session = CallSession::outgoing(session_id, peer, media_kind, now);
        session.media_requested = true;
        effects.push(Effect::Negotiate {
            session_id,
            command: NegotiationCommand::CreateOffer { media_kind },
        });
        effects.push(Effect::StartTimer {
            session_id,
            timer: TimerKind::Ring,
        });
        info!(
            %session_id,
            peer = session.peer.user_id.0,
            ?media_kind,
            "call: dialing"
        );
        effects.push(state_changed(session_id, CallState::Dialing));
        registry.install(session);
        Ok(())
    }

    fn accept(&self, registry: &mut SessionRegistry, effects: &mut Vec<Effect>) -> Outcome {
        let session = registry.current_mut().ok_or(IgnoreReason::NoSession)?;
        if session.role != CallRole::Callee
            || session.state != CallState::Ringing
            || session.accept_requested
        {
            return Err(IgnoreReason::NotApplicable(session.state));
        }

        session.accept_requested = true;
        session.media_requested = true;
        effects.push(Effect::Negotiate {
            session_id: session.session_id,
            command: NegotiationCommand::PrepareMedia {
                media_kind: session.media_kind,
            },
        });
        Ok(())
    }

    fn reject(
        &self,
        registry: &mut SessionRegistry,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Outcome {
        let session = registry.current().ok_or(IgnoreReason::NoSession)?;
        if session.role != CallRole::Callee || session.state != CallState::Ringing {
            return Err(IgnoreReason::NotApplicable(session.state));
        }

        effects.push(self.send(session, Signal::Reject));
        finish(registry, EndReason::Rejected, None, now, effects);
        Ok(())
    }

    fn cancel(
        &self,
        registry: &mut SessionRegistry,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Outcome {
        let session = registry.current().ok_or(IgnoreReason::NoSession)?;
        if session.role != CallRole::Caller || session.state != CallState::Dialing {
            return Err(IgnoreReason::NotApplicable(session.state));
        }

        if session.invite_sent() {
            effects.push(self.send(session, Signal::Cancel));
        }
        finish(registry, EndReason::Cancelled, None, now, effects);
        Ok(())
    }

    fn hangup(
        &self,
        registry: &mut SessionRegistry,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Outcome {
        let session = registry.current().ok_or(IgnoreReason::NoSession)?;
        match session.state {
            CallState::Dialing => self.cancel(registry, now, effects),
            CallState::Ringing => self.reject(registry, now, effects),
            CallState::Connecting => {
                effects.push(self.send(session, Signal::Hangup));
                finish(registry, EndReason::Cancelled, None, now, effects);
                Ok(())
            }
            CallState::Active => {
                effects.push(self.send(session, Signal::Hangup));
                finish(registry, EndReason::Completed, None, now, effects);
                Ok(())
            }
            state => Err(IgnoreReason::NotApplicable(state)),
        }
    }

    fn on_remote(
        &self,
        registry: &mut SessionRegistry,
        message: SignalingMessage,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Outcome {
        message.validate().map_err(IgnoreReason::Malformed)?;
        if message.to_user_id != self.local.user_id {
            return Err(IgnoreReason::Misaddressed);
        }
        if matches!(message.signal, Signal::Invite { .. }) {
            return self.on_invite(registry, message, now, effects);
        }

        let session = registry.current_mut().ok_or(IgnoreReason::NoSession)?;
        if session.session_id != message.session_id {
            return Err(IgnoreReason::SessionMismatch);
        }
        if session.peer.user_id != message.from_user_id {
            return Err(IgnoreReason::UnknownSender);
        }

        match (session.role, session.state, message.signal) {
            (CallRole::Caller, CallState::Dialing, Signal::Accept) => {
                let Some(offer) = session.local_offer.clone() else {
                    return Err(IgnoreReason::NotApplicable(CallState::Dialing));
                };
                effects.push(Effect::CancelTimer(TimerKind::Ring));
                effects.push(self.send(session, Signal::Offer { description: offer }));
                self.flush_outbound_candidates(session, effects);
                effects.push(Effect::StartTimer {
                    session_id: session.session_id,
                    timer: TimerKind::Negotiation,
                });
                enter(session, CallState::Connecting, effects);
            }
            (CallRole::Caller, CallState::Dialing, Signal::Reject) => {
                finish(registry, EndReason::Rejected, None, now, effects);
            }
            (CallRole::Caller, CallState::Dialing, Signal::Busy) => {
                finish(
                    registry,
                    EndReason::Busy,
                    Some(CallFailure::PeerBusy),
                    now,
                    effects,
                );
            }
            (CallRole::Callee, CallState::Ringing, Signal::Cancel) => {
                finish(registry, EndReason::Cancelled, None, now, effects);
            }
            (
                CallRole::Callee,
                CallState::Connecting | CallState::Active,
                Signal::Offer { description },
            ) if !session.remote_description_applied => {
                apply_remote_description(
                    session,
                    NegotiationCommand::ApplyRemoteOffer(description),
                    effects,
                );
            }
            (
                CallRole::Caller,
                CallState::Connecting | CallState::Active,
                Signal::Answer { description },
            ) if !session.remote_description_applied => {
                apply_remote_description(
                    session,
                    NegotiationCommand::ApplyRemoteAnswer(description),
                    effects,
                );
            }
            (_, CallState::Connecting | CallState::Active, Signal::Candidate { candidate }) => {
                if session.remote_description_applied {
                    effects.push(Effect::Negotiate {
                        session_id: session.session_id,
                        command: NegotiationCommand::AddRemoteCandidate(candidate),
                    });
                } else {
                    debug!(
                        session_id = %session.session_id,
                        buffered = session.pending_candidates.len() + 1,
                        "call: buffering remote candidate"
                    );
                    session.pending_candidates.push_back(candidate);
                }
            }
            (_, CallState::Active, Signal::Hangup) => {
                finish(registry, EndReason::Completed, None, now, effects);
            }
            (_, CallState::Connecting, Signal::Hangup) => {
                finish(registry, EndReason::Cancelled, None, now, effects);
            }
            (_, state, _) => return Err(IgnoreReason::NotApplicable(state)),
        }
        Ok(())
    }

    fn on_invite(
        &self,
        registry: &mut SessionRegistry,
        message: SignalingMessage,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Outcome {
        match arbitrate_invite(registry, &message) {
            InviteVerdict::Duplicate => Err(IgnoreReason::Duplicate),
            InviteVerdict::Busy => {
                info!(
                    session_id = %message.session_id,
                    from = message.from_user_id.0,
                    state = %registry.state(),
                    "call: busy, declining invite"
                );
                effects.push(self.busy_reply(&message));
                Ok(())
            }
            InviteVerdict::Glare => {
                let session = registry.current().ok_or(IgnoreReason::NoSession)?;
                info!(
                    session_id = %session.session_id,
                    invite = %message.session_id,
                    peer = message.from_user_id.0,
                    "call: glare, dropping both calls"
                );
                effects.push(self.busy_reply(&message));
                if session.invite_sent() {
                    effects.push(self.send(session, Signal::Cancel));
                }
                finish(
                    registry,
                    EndReason::Busy,
                    Some(CallFailure::PeerBusy),
                    now,
                    effects,
                );
                Ok(())
            }
            InviteVerdict::Admit => {
                let Signal::Invite {
                    media_kind,
                    caller_name,
                    caller_avatar_url,
                } = message.signal
                else {
                    return Err(IgnoreReason::NotApplicable(registry.state()));
                };
                let session_id = message.session_id;
                let peer = PeerInfo {
                    user_id: message.from_user_id,
                    display_name: caller_name,
                    avatar_url: caller_avatar_url,
                };

                effects.push(Effect::StartTimer {
                    session_id,
                    timer: TimerKind::Ring,
                });
                info!(%session_id, peer = peer.user_id.0, ?media_kind, "call: ringing");
                effects.push(state_changed(session_id, CallState::Ringing));
                effects.push(Effect::Notify(CallNotification::IncomingCall {
                    session_id,
                    peer: peer.clone(),
                    media_kind,
                }));
                registry.install(CallSession::incoming(session_id, peer, media_kind, now));
                Ok(())
            }
        }
    }

    fn on_peer_gone(
        &self,
        registry: &mut SessionRegistry,
        session_id: Option<SessionId>,
        user_id: UserId,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Outcome {
        let session = registry.current().ok_or(IgnoreReason::NoSession)?;
        if session_id.is_some_and(|id| id != session.session_id) {
            return Err(IgnoreReason::SessionMismatch);
        }
        if session.peer.user_id != user_id {
            return Err(IgnoreReason::UnknownSender);
        }

        match session.state {
            CallState::Active => finish(registry, EndReason::Completed, None, now, effects),
            CallState::Ringing => finish(registry, EndReason::Cancelled, None, now, effects),
            CallState::Dialing | CallState::Connecting => finish(
                registry,
                EndReason::Failed,
                Some(CallFailure::PeerUnavailable),
                now,
                effects,
            ),
            state => return Err(IgnoreReason::NotApplicable(state)),
        }
        Ok(())
    }

    fn on_timer(
        &self,
        registry: &mut SessionRegistry,
        session_id: SessionId,
        timer: TimerKind,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Outcome {
        let session = registry.current().ok_or(IgnoreReason::NoSession)?;
        if session.session_id != session_id {
            return Err(IgnoreReason::SessionMismatch);
        }

        match (timer, session.state) {
            (TimerKind::Ring, CallState::Dialing) => {
                if session.invite_sent() {
                    effects.push(self.send(session, Signal::Cancel));
                }
                finish(
                    registry,
                    EndReason::Timeout,
                    Some(CallFailure::Timeout(TimerKind::Ring)),
                    now,
                    effects,
                );
            }
            (TimerKind::Ring, CallState::Ringing) => {
                finish(registry, EndReason::Missed, None, now, effects);
            }
            (TimerKind::Negotiation, CallState::Connecting) => {
                effects.push(self.send(session, Signal::Hangup));
                finish(
                    registry,
                    EndReason::Failed,
                    Some(CallFailure::Timeout(TimerKind::Negotiation)),
                    now,
                    effects,
                );
            }
            (_, state) => return Err(IgnoreReason::NotApplicable(state)),
        }
        Ok(())
    }

    fn on_negotiation(
        &self,
        registry: &mut SessionRegistry,
        session_id: SessionId,
        event: NegotiationEvent,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) -> Outcome {
        let session = registry.current_mut().ok_or(IgnoreReason::NoSession)?;
        if session.session_id != session_id {
            return Err(IgnoreReason::SessionMismatch);
        }

        match (session.role, session.state, event) {
            (CallRole::Caller, CallState::Dialing, NegotiationEvent::LocalOffer(description))
                if session.local_offer.is_none() =>
            {
                let media_kind = session.media_kind;
                let invite = self.send(
                    session,
                    Signal::Invite {
                        media_kind,
                        caller_name: self.local.display_name.clone(),
                        caller_avatar_url: self.local.avatar_url.clone(),
                    },
                );
                session.local_offer = Some(description);
                effects.push(invite);
            }
            (CallRole::Callee, CallState::Ringing, NegotiationEvent::MediaReady)
                if session.accept_requested =>
            {
                effects.push(Effect::CancelTimer(TimerKind::Ring));
                effects.push(self.send(session, Signal::Accept));
                self.flush_outbound_candidates(session, effects);
                effects.push(Effect::StartTimer {
                    session_id,
                    timer: TimerKind::Negotiation,
                });
                enter(session, CallState::Connecting, effects);
            }
            (CallRole::Caller, CallState::Dialing, NegotiationEvent::MediaUnavailable(reason)) => {
                finish(
                    registry,
                    EndReason::Failed,
                    Some(CallFailure::LocalMediaUnavailable(reason)),
                    now,
                    effects,
                );
            }
            (CallRole::Callee, CallState::Ringing, NegotiationEvent::MediaUnavailable(reason))
                if session.accept_requested =>
            {
                effects.push(self.send(session, Signal::Reject));
                finish(
                    registry,
                    EndReason::Failed,
                    Some(CallFailure::LocalMediaUnavailable(reason)),
                    now,
                    effects,
                );
            }
            (
                CallRole::Callee,
                CallState::Connecting | CallState::Active,
                NegotiationEvent::LocalAnswer(description),
            ) => {
                effects.push(self.send(session, Signal::Answer { description }));
            }
            (_, CallState::Dialing | CallState::Ringing, NegotiationEvent::LocalCandidate(candidate)) => {
                session.outbound_candidates.push(candidate);
            }
            (
                _,
                CallState::Connecting | CallState::Active,
                NegotiationEvent::LocalCandidate(candidate),
            ) => {
                effects.push(self.send(session, Signal::Candidate { candidate }));
            }
            (_, CallState::Connecting, NegotiationEvent::Connected) => {
                effects.push(Effect::CancelTimer(TimerKind::Negotiation));
                session.connected_at = Some(now);
                enter(session, CallState::Active, effects);
            }
            (CallRole::Caller, CallState::Dialing, NegotiationEvent::Failed(reason)) => {
                if session.invite_sent() {
                    effects.push(self.send(session, Signal::Cancel));
                }
                finish(
                    registry,
                    EndReason::Failed,
                    Some(CallFailure::NegotiationFailure(reason)),
                    now,
                    effects,
                );
            }
            (CallRole::Callee, CallState::Ringing, NegotiationEvent::Failed(reason))
                if session.accept_requested =>
            {
                effects.push(self.send(session, Signal::Reject));
                finish(
                    registry,
                    EndReason::Failed,
                    Some(CallFailure::NegotiationFailure(reason)),
                    now,
                    effects,
                );
            }
            (_, CallState::Connecting, NegotiationEvent::Failed(reason)) => {
                effects.push(self.send(session, Signal::Hangup));
                finish(
                    registry,
                    EndReason::Failed,
                    Some(CallFailure::NegotiationFailure(reason)),
                    now,
                    effects,
                );
            }
            (_, state, _) => return Err(IgnoreReason::NotApplicable(state)),
        }
        Ok(())
    }

    fn send(&self, session: &CallSession, signal: Signal) -> Effect {
        Effect::Send(SignalingMessage::new(
            session.session_id,
            self.local.user_id,
            session.peer.user_id,
            signal,
        ))
    }

    fn busy_reply(&self, invite: &SignalingMessage) -> Effect {
        Effect::Send(SignalingMessage::new(
            invite.session_id,
            self.local.user_id,
            invite.from_user_id,
            Signal::Busy,
        ))
    }

    fn flush_outbound_candidates(&self, session: &mut CallSession, effects: &mut Vec<Effect>) {
        let queued = std::mem::take(&mut session.outbound_candidates);
        for candidate in queued {
            effects.push(self.send(session, Signal::Candidate { candidate }));
        }
    }
}

fn state_changed(session_id: SessionId, state: CallState) -> Effect {
    Effect::Notify(CallNotification::StateChanged { session_id, state })
}

fn enter(session: &mut CallSession, state: CallState, effects: &mut Vec<Effect>) {
    info!(
        session_id = %session.session_id,
        from = %session.state,
        to = %state,
        "call: state changed"
    );
    session.state = state;
    effects.push(state_changed(session.session_id, state));
}

/// Marks the remote description as applied and flushes buffered candidates
/// behind it, oldest first.
fn apply_remote_description(
    session: &mut CallSession,
    command: NegotiationCommand,
    effects: &mut Vec<Effect>,
) {
    session.remote_description_applied = true;
    effects.push(Effect::Negotiate {
        session_id: session.session_id,
        command,
    });
    while let Some(candidate) = session.pending_candidates.pop_front() {
        effects.push(Effect::Negotiate {
            session_id: session.session_id,
            command: NegotiationCommand::AddRemoteCandidate(candidate),
        });
    }
}

/// Moves the current session to `Ended`, tears down its timers and media,
/// reports the outcome and discards it.
fn finish(
    registry: &mut SessionRegistry,
    reason: EndReason,
    failure: Option<CallFailure>,
    now: DateTime<Utc>,
    effects: &mut Vec<Effect>,
) {
    let Some(session) = registry.current_mut() else {
        return;
    };
    let session_id = session.session_id;

    match session.state {
        CallState::Dialing | CallState::Ringing => {
            effects.push(Effect::CancelTimer(TimerKind::Ring));
        }
        CallState::Connecting => effects.push(Effect::CancelTimer(TimerKind::Negotiation)),
        _ => {}
    }
    if session.media_requested {
        effects.push(Effect::Negotiate {
            session_id,
            command: NegotiationCommand::Release,
        });
    }

    session.ended_at = Some(now);
    session.end_reason = Some(reason);
    enter(session, CallState::Ended, effects);
    let duration_ms = session.duration_ms();
    info!(%session_id, %reason, duration_ms, failure = ?failure, "call: ended");
    effects.push(Effect::Notify(CallNotification::CallEnded {
        session_id,
        reason,
        duration_ms,
        failure,
    }));

    registry.retire();
    effects.push(state_changed(session_id, CallState::Idle));
}

#[cfg(test)]
#[path = "tests/fsm_tests.rs"]
mod tests;
