//! In-memory media doubles shared by the client tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use anyhow::bail;
use async_trait::async_trait;
use media_integration::{
    MediaConnectionState, MediaEvent, MediaSession, MediaSessionFactory, MediaSessionOptions,
};
use shared::protocol::{IceCandidate, SessionDescription};
use tokio::sync::{broadcast, Notify};

pub struct FakeMediaSession {
    events: broadcast::Sender<MediaEvent>,
    calls: Mutex<Vec<String>>,
    closed: AtomicUsize,
    auto_connect: bool,
    offer_gate: Option<Arc<Notify>>,
}

impl FakeMediaSession {
    fn new(auto_connect: bool, offer_gate: Option<Arc<Notify>>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            events,
            calls: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
            auto_connect,
            offer_gate,
        }
    }

    pub fn emit(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().expect("calls").push(call.into());
    }
}

#[async_trait]
impl MediaSession for FakeMediaSession {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        self.record("create_offer");
        if let Some(gate) = &self.offer_gate {
            gate.notified().await;
        }
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        self.record("create_answer");
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> anyhow::Result<()> {
        self.record(format!("set_remote:{:?}", description.sdp_type));
        if self.auto_connect {
            self.emit(MediaEvent::LocalCandidate(IceCandidate::new(
                "candidate:1 1 udp 2122 192.0.2.1 5000 typ host",
            )));
            self.emit(MediaEvent::ConnectionStateChanged(
                MediaConnectionState::Connected,
            ));
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        self.record(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }
}

/// Opens [`FakeMediaSession`]s. With `auto_connect`, a session reports
/// `Connected` as soon as a remote description is applied.
pub struct FakeMediaFactory {
    denied: Option<String>,
    auto_connect: bool,
    offer_gate: Option<Arc<Notify>>,
    opened: Mutex<Vec<(MediaSessionOptions, Arc<FakeMediaSession>)>>,
}

impl FakeMediaFactory {
    pub fn connecting() -> Arc<Self> {
        Arc::new(Self {
            denied: None,
            auto_connect: true,
            offer_gate: None,
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn manual() -> Arc<Self> {
        Arc::new(Self {
            denied: None,
            auto_connect: false,
            offer_gate: None,
            opened: Mutex::new(Vec::new()),
        })
    }

    /// Like [`FakeMediaFactory::manual`], but each offer waits for `gate`.
    pub fn gated_offers(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            denied: None,
            auto_connect: false,
            offer_gate: Some(gate),
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn denied(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            denied: Some(reason.to_string()),
            auto_connect: false,
            offer_gate: None,
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn opened(&self) -> Vec<(MediaSessionOptions, Arc<FakeMediaSession>)> {
        self.opened.lock().expect("opened").clone()
    }

    pub fn last_session(&self) -> Arc<FakeMediaSession> {
        self.opened()
            .last()
            .map(|(_, session)| session.clone())
            .expect("a media session was opened")
    }
}

#[async_trait]
impl MediaSessionFactory for FakeMediaFactory {
    async fn open(&self, options: MediaSessionOptions) -> anyhow::Result<Arc<dyn MediaSession>> {
        if let Some(reason) = &self.denied {
            bail!("{reason}");
        }
        let session = Arc::new(FakeMediaSession::new(self.auto_connect, self.offer_gate.clone()));
        self.opened
            .lock()
            .expect("opened")
            .push((options, session.clone()));
        Ok(session as Arc<dyn MediaSession>)
    }
}
