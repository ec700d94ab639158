use shared::domain::CallState;
use thiserror::Error;

use crate::fsm::TimerKind;

/// Why a user action was refused. A refused action changes nothing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("a call is already in progress ({0})")]
    AlreadyInCall(CallState),
    #[error("no call in progress")]
    NoActiveCall,
    #[error("cannot {action} while {state}")]
    InvalidAction {
        action: &'static str,
        state: CallState,
    },
    #[error("cannot call yourself")]
    SelfCall,
    #[error("call client has stopped")]
    ClientStopped,
}

/// Failure detail attached to a call that ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallFailure {
    #[error("peer is unavailable")]
    PeerUnavailable,
    #[error("peer is busy")]
    PeerBusy,
    #[error("{0} timer expired")]
    Timeout(TimerKind),
    #[error("media negotiation failed: {0}")]
    NegotiationFailure(String),
    #[error("local media unavailable: {0}")]
    LocalMediaUnavailable(String),
}

#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("relay connection is not established")]
    NotConnected,
    #[error("invalid relay url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to connect relay: {0}")]
    Connect(String),
    #[error("failed to encode relay frame: {0}")]
    Encode(#[from] serde_json::Error),
}
