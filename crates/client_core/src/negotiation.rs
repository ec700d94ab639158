//! Adapter between the state machine's [`NegotiationCommand`]s and the
//! platform [`MediaSession`].
//!
//! Commands run one at a time on a worker task. Results come back to the
//! client's internal queue as [`CallInput::Negotiation`] reports. Each media
//! session reports `Connected` or `Failed` at most once.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use media_integration::{
    MediaConnectionState, MediaEvent, MediaSession, MediaSessionFactory, MediaSessionOptions,
};
use shared::domain::{MediaKind, SessionId};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::fsm::{CallInput, NegotiationCommand, NegotiationEvent};

#[derive(Clone)]
pub struct NegotiationHandle {
    commands: mpsc::UnboundedSender<(SessionId, NegotiationCommand)>,
}

impl NegotiationHandle {
    /// Queues a command. Returns `false` once the worker has stopped.
    pub fn submit(&self, session_id: SessionId, command: NegotiationCommand) -> bool {
        self.commands.send((session_id, command)).is_ok()
    }
}

pub fn spawn_negotiation(
    factory: Arc<dyn MediaSessionFactory>,
    reports: mpsc::UnboundedSender<CallInput>,
) -> (NegotiationHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let worker = NegotiationWorker {
        factory,
        reports,
        current: None,
    };
    let task = tokio::spawn(worker.run(commands_rx));
    (
        NegotiationHandle {
            commands: commands_tx,
        },
        task,
    )
}

struct ActiveMedia {
    session_id: SessionId,
    media: Arc<dyn MediaSession>,
    settled: Arc<AtomicBool>,
    forwarder: JoinHandle<()>,
}

struct NegotiationWorker {
    factory: Arc<dyn MediaSessionFactory>,
    reports: mpsc::UnboundedSender<CallInput>,
    current: Option<ActiveMedia>,
}

impl NegotiationWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<(SessionId, NegotiationCommand)>) {
        while let Some((session_id, command)) = commands.recv().await {
            self.handle(session_id, command).await;
        }
        if let Some(active) = self.current.take() {
            close(active).await;
        }
    }

    async fn handle(&mut self, session_id: SessionId, command: NegotiationCommand) {
        match command {
            NegotiationCommand::CreateOffer { media_kind } => {
                let Some(media) = self.open(session_id, media_kind).await else {
                    return;
                };
                match media.create_offer().await {
                    Ok(offer) => self.report(session_id, NegotiationEvent::LocalOffer(offer)),
                    Err(err) => self.fail(session_id, format!("create offer: {err:#}")),
                }
            }
            NegotiationCommand::PrepareMedia { media_kind } => {
                if self.open(session_id, media_kind).await.is_some() {
                    self.report(session_id, NegotiationEvent::MediaReady);
                }
            }
            NegotiationCommand::ApplyRemoteOffer(offer) => {
                let Some(media) = self.media_for(session_id) else {
                    return;
                };
                let answer = async {
                    media.set_remote_description(offer).await?;
                    media.create_answer().await
                };
                match answer.await {
                    Ok(answer) => self.report(session_id, NegotiationEvent::LocalAnswer(answer)),
                    Err(err) => self.fail(session_id, format!("apply offer: {err:#}")),
                }
            }
            NegotiationCommand::ApplyRemoteAnswer(answer) => {
                let Some(media) = self.media_for(session_id) else {
                    return;
                };
                if let Err(err) = media.set_remote_description(answer).await {
                    self.fail(session_id, format!("apply answer: {err:#}"));
                }
            }
            NegotiationCommand::AddRemoteCandidate(candidate) => {
                let Some(media) = self.media_for(session_id) else {
                    return;
                };
                if let Err(err) = media.add_remote_candidate(candidate).await {
                    warn!(%session_id, error = %err, "negotiation: remote candidate rejected");
                }
            }
            NegotiationCommand::Release => {
                if self
                    .current
                    .as_ref()
                    .is_some_and(|active| active.session_id == session_id)
                {
                    if let Some(active) = self.current.take() {
                        close(active).await;
                    }
                } else {
                    debug!(%session_id, "negotiation: nothing to release");
                }
            }
        }
    }

    /// Acquires local media for `session_id`. A failure is reported as
    /// `MediaUnavailable`.
    async fn open(
        &mut self,
        session_id: SessionId,
        media_kind: MediaKind,
    ) -> Option<Arc<dyn MediaSession>> {
        if let Some(previous) = self.current.take() {
            warn!(
                previous = %previous.session_id,
                %session_id,
                "negotiation: releasing media left by an earlier session"
            );
            close(previous).await;
        }

        match self.factory.open(MediaSessionOptions::for_kind(media_kind)).await {
            Ok(media) => {
                info!(%session_id, ?media_kind, "negotiation: local media acquired");
                let settled = Arc::new(AtomicBool::new(false));
                let forwarder = tokio::spawn(forward_media_events(
                    session_id,
                    media.subscribe_events(),
                    self.reports.clone(),
                    settled.clone(),
                ));
                self.current = Some(ActiveMedia {
                    session_id,
                    media: media.clone(),
                    settled,
                    forwarder,
                });
                Some(media)
            }
            Err(err) => {
                warn!(%session_id, error = %err, "negotiation: local media unavailable");
                self.report(
                    session_id,
                    NegotiationEvent::MediaUnavailable(format!("{err:#}")),
                );
                None
            }
        }
    }

    fn media_for(&self, session_id: SessionId) -> Option<Arc<dyn MediaSession>> {
        match &self.current {
            Some(active) if active.session_id == session_id => Some(active.media.clone()),
            _ => {
                debug!(%session_id, "negotiation: no media for session, command dropped");
                None
            }
        }
    }

    fn fail(&self, session_id: SessionId, reason: String) {
        warn!(%session_id, %reason, "negotiation: failed");
        let first = self
            .current
            .as_ref()
            .filter(|active| active.session_id == session_id)
            .is_some_and(|active| !active.settled.swap(true, Ordering::AcqRel));
        if first {
            self.report(session_id, NegotiationEvent::Failed(reason));
        }
    }

    fn report(&self, session_id: SessionId, event: NegotiationEvent) {
        let _ = self
            .reports
            .send(CallInput::Negotiation { session_id, event });
    }
}

async fn close(active: ActiveMedia) {
    active.forwarder.abort();
    match active.media.close().await {
        Ok(()) => info!(session_id = %active.session_id, "negotiation: media released"),
        Err(err) => warn!(
            session_id = %active.session_id,
            error = %err,
            "negotiation: media close failed"
        ),
    }
}

async fn forward_media_events(
    session_id: SessionId,
    mut events: broadcast::Receiver<MediaEvent>,
    reports: mpsc::UnboundedSender<CallInput>,
    settled: Arc<AtomicBool>,
) {
    loop {
        let event = match events.recv().await {
            Ok(MediaEvent::LocalCandidate(candidate)) => NegotiationEvent::LocalCandidate(candidate),
            Ok(MediaEvent::ConnectionStateChanged(state)) => {
                if settled.swap(true, Ordering::AcqRel) {
                    debug!(%session_id, ?state, "negotiation: connection already settled");
                    continue;
                }
                match state {
                    MediaConnectionState::Connected => NegotiationEvent::Connected,
                    MediaConnectionState::Failed { reason } => NegotiationEvent::Failed(reason),
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(%session_id, skipped, "negotiation: media events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if reports
            .send(CallInput::Negotiation { session_id, event })
            .is_err()
        {
            break;
        }
    }
}

#[cfg(test)]
#[path = "tests/negotiation_tests.rs"]
mod tests;
