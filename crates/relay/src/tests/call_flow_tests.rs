//! Two call clients talking through a live relay.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use client_core::{CallClient, CallFailure, CallNotification, CallSettings};
use media_integration::{
    MediaConnectionState, MediaEvent, MediaSession, MediaSessionFactory, MediaSessionOptions,
};
use relay_api::{mint_relay_token, JwtCredentialValidator, RelayHub, RelayTokenConfig};
use shared::{
    domain::{CallState, EndReason, MediaKind, PeerInfo, UserId},
    protocol::{IceCandidate, SessionDescription},
};
use tokio::{net::TcpListener, sync::broadcast, time::timeout};

use super::{
    app_state::{AppState, FrameLimits},
    build_router,
};

const SECRET: &str = "call-flow-secret";

/// Media double that connects as soon as the remote description lands.
struct LoopbackMedia {
    events: broadcast::Sender<MediaEvent>,
}

#[async_trait]
impl MediaSession for LoopbackMedia {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::offer("v=0 loopback-offer"))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::answer("v=0 loopback-answer"))
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> anyhow::Result<()> {
        let _ = self.events.send(MediaEvent::LocalCandidate(IceCandidate::new(
            "candidate:1 1 udp 2122 127.0.0.1 40000 typ host",
        )));
        let _ = self.events.send(MediaEvent::ConnectionStateChanged(
            MediaConnectionState::Connected,
        ));
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: IceCandidate) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }
}

struct LoopbackMediaFactory;

#[async_trait]
impl MediaSessionFactory for LoopbackMediaFactory {
    async fn open(&self, _options: MediaSessionOptions) -> anyhow::Result<Arc<dyn MediaSession>> {
        let (events, _) = broadcast::channel(16);
        Ok(Arc::new(LoopbackMedia { events }) as Arc<dyn MediaSession>)
    }
}

async fn spawn_relay() -> (String, Arc<AppState>) {
    let state = Arc::new(AppState {
        hub: RelayHub::new(),
        validator: Arc::new(JwtCredentialValidator::new(SECRET)),
        limits: FrameLimits {
            max_message_bytes: 16 * 1024,
            rate_limit_per_second: 100,
        },
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = build_router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

async fn sign_in(
    relay_url: &str,
    user_id: i64,
    name: &str,
) -> (Arc<CallClient>, broadcast::Receiver<CallNotification>) {
    let settings = CallSettings {
        relay_url: relay_url.to_string(),
        reconnect_delay: Duration::from_millis(100),
        ..CallSettings::default()
    };
    let token = mint_relay_token(
        &RelayTokenConfig {
            secret: SECRET.into(),
            ttl_seconds: 300,
        },
        UserId(user_id),
    )
    .expect("token");
    let (client, _task) = CallClient::connect(
        &settings,
        PeerInfo::new(UserId(user_id), name),
        &token,
        Arc::new(LoopbackMediaFactory),
    )
    .await
    .expect("connect");
    let events = client.subscribe_events();
    (client, events)
}

async fn next_matching(
    events: &mut broadcast::Receiver<CallNotification>,
    matches: impl Fn(&CallNotification) -> bool,
) -> CallNotification {
    loop {
        let notification = timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("notification in time")
            .expect("event stream open");
        if matches(&notification) {
            return notification;
        }
    }
}

async fn ended(events: &mut broadcast::Receiver<CallNotification>) -> (EndReason, Option<CallFailure>) {
    match next_matching(events, |n| matches!(n, CallNotification::CallEnded { .. })).await {
        CallNotification::CallEnded {
            reason, failure, ..
        } => (reason, failure),
        other => panic!("unexpected notification {other:?}"),
    }
}

/// Registration completes on the relay side after the upgrade handshake.
async fn wait_for_registration(state: &AppState, users: &[i64]) {
    for _ in 0..100 {
        let mut all = true;
        for user_id in users {
            all &= state.hub.is_connected(UserId(*user_id)).await;
        }
        if all {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("users {users:?} never registered");
}

#[tokio::test]
async fn call_connects_and_completes_through_the_relay() {
    let (relay_url, state) = spawn_relay().await;
    let (alice, mut alice_events) = sign_in(&relay_url, 1, "Dr. Alice").await;
    let (bob, mut bob_events) = sign_in(&relay_url, 2, "Bob").await;
    wait_for_registration(&state, &[1, 2]).await;

    let session_id = alice
        .start_call(bob.local().clone(), MediaKind::Video)
        .await
        .expect("start");

    let incoming = next_matching(&mut bob_events, |n| {
        matches!(n, CallNotification::IncomingCall { .. })
    })
    .await;
    assert_eq!(incoming.session_id(), session_id);

    bob.accept().await.expect("accept");
    for events in [&mut alice_events, &mut bob_events] {
        next_matching(events, |n| {
            matches!(n, CallNotification::StateChanged { state: CallState::Active, .. })
        })
        .await;
    }

    bob.hangup().await.expect("hangup");
    assert_eq!(ended(&mut bob_events).await, (EndReason::Completed, None));
    assert_eq!(ended(&mut alice_events).await, (EndReason::Completed, None));
}

#[tokio::test]
async fn calling_an_offline_user_fails() {
    let (relay_url, state) = spawn_relay().await;
    let (alice, mut alice_events) = sign_in(&relay_url, 1, "Alice").await;
    wait_for_registration(&state, &[1]).await;

    alice
        .start_call(PeerInfo::new(UserId(42), "Offline"), MediaKind::Audio)
        .await
        .expect("start");

    assert_eq!(
        ended(&mut alice_events).await,
        (EndReason::Failed, Some(CallFailure::PeerUnavailable))
    );
}
