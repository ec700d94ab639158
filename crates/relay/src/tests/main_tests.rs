use super::*;
use axum::{body, body::Body, http::Request};
use relay_api::{mint_relay_token, RelayTokenConfig};
use shared::{
    domain::SessionId,
    protocol::{Signal, SignalingMessage},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tower::ServiceExt;

const SECRET: &str = "test-secret";

type TestSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_state(rate_limit_per_second: u32) -> Arc<AppState> {
    Arc::new(AppState {
        hub: RelayHub::new(),
        validator: Arc::new(JwtCredentialValidator::new(SECRET)),
        limits: FrameLimits {
            max_message_bytes: 4096,
            rate_limit_per_second,
        },
    })
}

fn token_for(user_id: i64) -> String {
    mint_relay_token(
        &RelayTokenConfig {
            secret: SECRET.into(),
            ttl_seconds: 60,
        },
        UserId(user_id),
    )
    .expect("token")
}

async fn spawn_relay(state: Arc<AppState>) -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = build_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("ws://{addr}/ws"))
}

async fn connect_as(url: &str, user_id: i64) -> TestSocket {
    let (socket, _) = connect_async(format!("{url}?access_token={}", token_for(user_id)))
        .await
        .expect("connect");
    socket
}

async fn wait_until_connected(state: &AppState, user_id: i64) {
    for _ in 0..100 {
        if state.hub.is_connected(UserId(user_id)).await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("user {user_id} never registered");
}

async fn send_request(socket: &mut TestSocket, request: &ClientRequest) {
    let text = serde_json::to_string(request).expect("json");
    socket.send(WsMessage::Text(text)).await.expect("send");
}

async fn next_event(socket: &mut TestSocket) -> ServerEvent {
    loop {
        let frame = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
            .await
            .expect("timely frame")
            .expect("open stream")
            .expect("frame");
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(&text).expect("server event");
        }
    }
}

fn invite(session_id: SessionId, from: i64, to: i64) -> ClientRequest {
    ClientRequest::Signal {
        message: SignalingMessage::new(
            session_id,
            UserId(from),
            UserId(to),
            Signal::Invite {
                media_kind: shared::domain::MediaKind::Audio,
                caller_name: "Reception".into(),
                caller_avatar_url: None,
            },
        ),
    }
}

#[tokio::test]
async fn healthz_reports_ok() {
    let app = build_router(test_state(10));
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn upgrade_without_credential_is_unauthorized() {
    let url = spawn_relay(test_state(10)).await.expect("relay");
    let err = connect_async(url.as_str()).await.expect_err("rejected");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn upgrade_with_bearer_header_is_accepted() {
    let state = test_state(10);
    let url = spawn_relay(Arc::clone(&state)).await.expect("relay");

    let mut request = url.as_str().into_client_request().expect("request");
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", token_for(12)).parse().expect("header"),
    );
    let (mut socket, _) = connect_async(request).await.expect("connect");

    send_request(&mut socket, &ClientRequest::Ping).await;
    assert!(matches!(next_event(&mut socket).await, ServerEvent::Pong));
    assert!(state.hub.is_connected(UserId(12)).await);
}

#[tokio::test]
async fn forwards_signals_and_reports_disconnect_to_correspondent() {
    let state = test_state(10);
    let url = spawn_relay(Arc::clone(&state)).await.expect("relay");
    let mut alice = connect_as(&url, 1).await;
    let mut bob = connect_as(&url, 2).await;
    wait_until_connected(&state, 1).await;
    wait_until_connected(&state, 2).await;

    let session_id = SessionId::generate();
    send_request(&mut alice, &invite(session_id, 1, 2)).await;

    match next_event(&mut bob).await {
        ServerEvent::Signal { message } => {
            assert_eq!(message.session_id, session_id);
            assert_eq!(message.kind(), "invite");
        }
        other => panic!("unexpected event {other:?}"),
    }

    alice.close(None).await.expect("close");
    match next_event(&mut bob).await {
        ServerEvent::PeerDisconnected { user_id } => assert_eq!(user_id, UserId(1)),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn offline_recipient_yields_peer_unavailable() {
    let state = test_state(10);
    let url = spawn_relay(Arc::clone(&state)).await.expect("relay");
    let mut alice = connect_as(&url, 1).await;

    let session_id = SessionId::generate();
    send_request(&mut alice, &invite(session_id, 1, 77)).await;

    match next_event(&mut alice).await {
        ServerEvent::PeerUnavailable {
            session_id: reported,
            user_id,
        } => {
            assert_eq!(reported, session_id);
            assert_eq!(user_id, UserId(77));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn spoofed_sender_is_rejected() {
    let state = test_state(10);
    let url = spawn_relay(Arc::clone(&state)).await.expect("relay");
    let mut alice = connect_as(&url, 1).await;

    send_request(&mut alice, &invite(SessionId::generate(), 5, 2)).await;
    match next_event(&mut alice).await {
        ServerEvent::Error(err) => assert_eq!(err.code, ErrorCode::Validation),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn malformed_and_excess_frames_get_error_frames() {
    let state = test_state(2);
    let url = spawn_relay(Arc::clone(&state)).await.expect("relay");
    let mut alice = connect_as(&url, 1).await;

    alice
        .send(WsMessage::Text("{not json".into()))
        .await
        .expect("send");
    match next_event(&mut alice).await {
        ServerEvent::Error(err) => assert_eq!(err.code, ErrorCode::Validation),
        other => panic!("unexpected event {other:?}"),
    }

    send_request(&mut alice, &ClientRequest::Ping).await;
    send_request(&mut alice, &ClientRequest::Ping).await;
    let mut saw_rate_limit = false;
    for _ in 0..2 {
        if let ServerEvent::Error(err) = next_event(&mut alice).await {
            assert_eq!(err.code, ErrorCode::RateLimited);
            saw_rate_limit = true;
        }
    }
    assert!(saw_rate_limit);
}
