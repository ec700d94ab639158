use crate::{
    domain::{CallState, MediaKind, SessionId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ClientRequest, IceCandidate, ServerEvent, SessionDescription, Signal,
        SignalValidationError, SignalingMessage,
    },
};

fn message(signal: Signal) -> SignalingMessage {
    SignalingMessage::new(SessionId::generate(), UserId(1), UserId(2), signal)
}

#[test]
fn invite_serializes_with_type_and_payload() {
    let msg = message(Signal::Invite {
        media_kind: MediaKind::Video,
        caller_name: "Dr. Ana".into(),
        caller_avatar_url: None,
    });
    let value = serde_json::to_value(&msg).expect("json");

    assert_eq!(value["signal"]["type"], "invite");
    assert_eq!(value["signal"]["payload"]["media_kind"], "video");
    assert!(value["signal"]["payload"].get("caller_avatar_url").is_none());
    assert_eq!(value["from_user_id"], 1);
    assert_eq!(value["session_id"], msg.session_id.0.to_string());
}

#[test]
fn unit_signals_parse_without_payload() {
    let session_id = SessionId::generate();
    let raw = format!(
        r#"{{"session_id":"{session_id}","from_user_id":7,"to_user_id":9,"signal":{{"type":"busy"}}}}"#
    );
    let parsed: SignalingMessage = serde_json::from_str(&raw).expect("parse");
    assert_eq!(parsed.signal, Signal::Busy);
    assert_eq!(parsed.session_id, session_id);
    assert_eq!(parsed.kind(), "busy");
}

#[test]
fn candidate_optional_fields_default_to_none() {
    let raw = r#"{"type":"candidate","payload":{"candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host"}}}"#;
    let parsed: Signal = serde_json::from_str(raw).expect("parse");
    match parsed {
        Signal::Candidate { candidate } => {
            assert_eq!(candidate.sdp_mid, None);
            assert_eq!(candidate.sdp_mline_index, None);
        }
        other => panic!("unexpected signal {other:?}"),
    }
}

#[test]
fn validate_rejects_self_addressed_messages() {
    let msg = SignalingMessage::new(SessionId::generate(), UserId(3), UserId(3), Signal::Accept);
    assert_eq!(msg.validate(), Err(SignalValidationError::SelfAddressed));
}

#[test]
fn validate_rejects_mismatched_or_empty_descriptions() {
    let wrong_type = message(Signal::Offer {
        description: SessionDescription::answer("v=0"),
    });
    assert!(matches!(
        wrong_type.validate(),
        Err(SignalValidationError::DescriptionTypeMismatch { kind: "offer", .. })
    ));

    let empty = message(Signal::Answer {
        description: SessionDescription::answer("  "),
    });
    assert_eq!(
        empty.validate(),
        Err(SignalValidationError::EmptyDescription("answer"))
    );

    let blank_candidate = message(Signal::Candidate {
        candidate: IceCandidate::new(""),
    });
    assert_eq!(
        blank_candidate.validate(),
        Err(SignalValidationError::EmptyCandidate)
    );

    assert!(message(Signal::Hangup).validate().is_ok());
}

#[test]
fn relay_frames_use_snake_case_tags() {
    let ping = serde_json::to_value(ClientRequest::Ping).expect("json");
    assert_eq!(ping["type"], "ping");

    let error = serde_json::to_value(ServerEvent::Error(ApiError::new(
        ErrorCode::RateLimited,
        "slow down",
    )))
    .expect("json");
    assert_eq!(error["type"], "error");
    assert_eq!(error["payload"]["code"], "rate_limited");

    let gone = serde_json::to_value(ServerEvent::PeerDisconnected { user_id: UserId(4) })
        .expect("json");
    assert_eq!(gone["payload"]["user_id"], 4);
}

#[test]
fn every_error_code_has_a_wire_name() {
    for code in [
        ErrorCode::Unauthorized,
        ErrorCode::Validation,
        ErrorCode::RateLimited,
    ] {
        let wire = match code {
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Validation => "validation",
            ErrorCode::RateLimited => "rate_limited",
        };
        assert_eq!(serde_json::to_value(code).expect("json"), wire);
    }
}

#[test]
fn only_idle_and_ended_are_not_live() {
    assert!(!CallState::Idle.is_live());
    assert!(!CallState::Ended.is_live());
    assert!(CallState::Dialing.is_live());
    assert!(CallState::Ringing.is_live());
    assert!(CallState::Connecting.is_live());
    assert!(CallState::Active.is_live());
}
