use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    domain::{MediaKind, SessionId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Signal {
    Invite {
        media_kind: MediaKind,
        caller_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller_avatar_url: Option<String>,
    },
    Accept,
    Reject,
    Cancel,
    Offer {
        description: SessionDescription,
    },
    Answer {
        description: SessionDescription,
    },
    Candidate {
        candidate: IceCandidate,
    },
    Hangup,
    Busy,
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Invite { .. } => "invite",
            Signal::Accept => "accept",
            Signal::Reject => "reject",
            Signal::Cancel => "cancel",
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate { .. } => "candidate",
            Signal::Hangup => "hangup",
            Signal::Busy => "busy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalValidationError {
    #[error("sender and recipient must differ")]
    SelfAddressed,
    #[error("{0} description must not be empty")]
    EmptyDescription(&'static str),
    #[error("{kind} must carry an {expected:?} description")]
    DescriptionTypeMismatch {
        kind: &'static str,
        expected: SdpType,
    },
    #[error("candidate must not be empty")]
    EmptyCandidate,
}

/// Wire unit exchanged between two clients through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub session_id: SessionId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub signal: Signal,
}

impl SignalingMessage {
    pub fn new(session_id: SessionId, from_user_id: UserId, to_user_id: UserId, signal: Signal) -> Self {
        Self {
            session_id,
            from_user_id,
            to_user_id,
            signal,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.signal.kind()
    }

    pub fn validate(&self) -> Result<(), SignalValidationError> {
        if self.from_user_id == self.to_user_id {
            return Err(SignalValidationError::SelfAddressed);
        }
        match &self.signal {
            Signal::Offer { description } => validate_description("offer", description, SdpType::Offer),
            Signal::Answer { description } => {
                validate_description("answer", description, SdpType::Answer)
            }
            Signal::Candidate { candidate } if candidate.candidate.trim().is_empty() => {
                Err(SignalValidationError::EmptyCandidate)
            }
            _ => Ok(()),
        }
    }
}

fn validate_description(
    kind: &'static str,
    description: &SessionDescription,
    expected: SdpType,
) -> Result<(), SignalValidationError> {
    if description.sdp_type != expected {
        return Err(SignalValidationError::DescriptionTypeMismatch { kind, expected });
    }
    if description.sdp.trim().is_empty() {
        return Err(SignalValidationError::EmptyDescription(kind));
    }
    Ok(())
}

/// Frames a client sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    Signal { message: SignalingMessage },
    Ping,
}

/// Frames the relay sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Signal {
        message: SignalingMessage,
    },
    PeerDisconnected {
        user_id: UserId,
    },
    PeerUnavailable {
        session_id: SessionId,
        user_id: UserId,
    },
    Pong,
    Error(ApiError),
}
