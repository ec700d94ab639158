//! Boundary over the platform's media-negotiation primitive (a WebRTC peer
//! connection on browser and mobile builds). The call orchestrator only talks
//! to these traits; each platform supplies its own implementation.

use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::MediaKind,
    protocol::{IceCandidate, SessionDescription},
};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSessionOptions {
    pub media_kind: MediaKind,
    pub capture_audio: bool,
    pub capture_video: bool,
}

impl MediaSessionOptions {
    pub fn for_kind(media_kind: MediaKind) -> Self {
        Self {
            media_kind,
            capture_audio: true,
            capture_video: media_kind.has_video(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaConnectionState {
    Connected,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    LocalCandidate(IceCandidate),
    ConnectionStateChanged(MediaConnectionState),
}

/// One peer connection with its local capture tracks attached.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_remote_description(&self, description: SessionDescription) -> anyhow::Result<()>;
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    /// Stops capture and closes the transport. Called exactly once per session.
    async fn close(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent>;
}

/// Acquires capture devices and opens a [`MediaSession`]. An error here means
/// the local device was denied or is unavailable.
#[async_trait]
pub trait MediaSessionFactory: Send + Sync {
    async fn open(&self, options: MediaSessionOptions) -> anyhow::Result<Arc<dyn MediaSession>>;
}
