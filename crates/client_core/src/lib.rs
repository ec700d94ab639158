//! Call orchestration for one signed-in user.
//!
//! [`CallClient`] owns the session registry and runs a single event loop that
//! feeds user actions, relay traffic, timer expirations and negotiation
//! reports through [`fsm::CallMachine::step`] one at a time, then executes the
//! returned effects in order.

use std::sync::Arc;

use chrono::Utc;
use media_integration::MediaSessionFactory;
use shared::domain::{MediaKind, PeerInfo, SessionId};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod arbiter;
pub mod config;
pub mod error;
pub mod events;
pub mod fsm;
pub mod negotiation;
pub mod session;
pub mod timers;
pub mod transport;

pub use config::{load_call_settings, CallSettings};
pub use error::{CallError, CallFailure, RelayClientError};
pub use events::CallNotification;
pub use session::{CallSession, SessionRegistry};
pub use transport::{RelayEvent, SignalingRelay, WsRelayClient};

use fsm::{CallInput, CallMachine, Disposition, Effect, IgnoreReason};
use negotiation::{spawn_negotiation, NegotiationHandle};
use timers::SessionTimers;

const EVENT_CAPACITY: usize = 256;

struct Command {
    input: CallInput,
    reply: oneshot::Sender<Disposition>,
}

pub struct CallClient {
    local: PeerInfo,
    commands: mpsc::UnboundedSender<Command>,
    registry: Arc<Mutex<SessionRegistry>>,
    events: broadcast::Sender<CallNotification>,
}

impl CallClient {
    /// Starts the event loop. The loop ends when the last `CallClient` handle
    /// is dropped; a live call is hung up on the way out.
    pub fn spawn(
        settings: &CallSettings,
        local: PeerInfo,
        relay: Arc<dyn SignalingRelay>,
        relay_events: mpsc::UnboundedReceiver<RelayEvent>,
        media: Arc<dyn MediaSessionFactory>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new(Mutex::new(SessionRegistry::new(
            settings.retired_session_capacity,
        )));
        let (negotiation, _) = spawn_negotiation(media, internal_tx.clone());

        let driver = Driver {
            machine: CallMachine::new(local.clone()),
            registry: registry.clone(),
            timers: SessionTimers::new(settings.ring_timeout, settings.negotiation_timeout),
            negotiation,
            relay,
            events: events.clone(),
            internal: internal_tx,
        };
        let task = tokio::spawn(driver.run(commands_rx, relay_events, internal_rx));

        let client = Arc::new(Self {
            local,
            commands: commands_tx,
            registry,
            events,
        });
        (client, task)
    }

    /// Connects to the relay over websocket and starts the event loop.
    pub async fn connect(
        settings: &CallSettings,
        local: PeerInfo,
        credential: &str,
        media: Arc<dyn MediaSessionFactory>,
    ) -> Result<(Arc<Self>, JoinHandle<()>), RelayClientError> {
        let (relay, relay_events) =
            WsRelayClient::connect(&settings.relay_url, credential, settings.reconnect_delay)
                .await?;
        Ok(Self::spawn(
            settings,
            local,
            Arc::new(relay),
            relay_events,
            media,
        ))
    }

    pub fn local(&self) -> &PeerInfo {
        &self.local
    }

    /// Dials `peer`. Returns the new session id once the call is `Dialing`.
    pub async fn start_call(
        &self,
        peer: PeerInfo,
        media_kind: MediaKind,
    ) -> Result<SessionId, CallError> {
        let session_id = SessionId::generate();
        self.submit(CallInput::Start {
            session_id,
            peer,
            media_kind,
        })
        .await?;
        Ok(session_id)
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.submit(CallInput::Accept).await
    }

    pub async fn reject(&self) -> Result<(), CallError> {
        self.submit(CallInput::Reject).await
    }

    pub async fn cancel(&self) -> Result<(), CallError> {
        self.submit(CallInput::Cancel).await
    }

    pub async fn hangup(&self) -> Result<(), CallError> {
        self.submit(CallInput::Hangup).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CallNotification> {
        self.events.subscribe()
    }

    /// Snapshot of the live call, if any.
    pub async fn current_session(&self) -> Option<CallSession> {
        self.registry.lock().await.current().cloned()
    }

    async fn submit(&self, input: CallInput) -> Result<(), CallError> {
        let action = input.user_action().unwrap_or("act");
        let is_start = matches!(input, CallInput::Start { .. });
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command {
                input,
                reply: reply_tx,
            })
            .map_err(|_| CallError::ClientStopped)?;
        let disposition = reply_rx.await.map_err(|_| CallError::ClientStopped)?;

        match disposition {
            Disposition::Applied => Ok(()),
            Disposition::Ignored(IgnoreReason::NoSession) => Err(CallError::NoActiveCall),
            Disposition::Ignored(IgnoreReason::SelfCall) => Err(CallError::SelfCall),
            Disposition::Ignored(IgnoreReason::NotApplicable(state)) if is_start => {
                Err(CallError::AlreadyInCall(state))
            }
            Disposition::Ignored(IgnoreReason::NotApplicable(state)) => {
                Err(CallError::InvalidAction { action, state })
            }
            Disposition::Ignored(_) => Err(CallError::InvalidAction {
                action,
                state: self.registry.lock().await.state(),
            }),
        }
    }
}

struct Driver {
    machine: CallMachine,
    registry: Arc<Mutex<SessionRegistry>>,
    timers: SessionTimers,
    negotiation: NegotiationHandle,
    relay: Arc<dyn SignalingRelay>,
    events: broadcast::Sender<CallNotification>,
    internal: mpsc::UnboundedSender<CallInput>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut relay_events: mpsc::UnboundedReceiver<RelayEvent>,
        mut internal: mpsc::UnboundedReceiver<CallInput>,
    ) {
        info!(user_id = self.machine.local().user_id.0, "call client: started");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    let disposition = self.apply(command.input).await;
                    let _ = command.reply.send(disposition);
                }
                Some(event) = relay_events.recv() => {
                    if let Some(input) = relay_input(event) {
                        self.apply(input).await;
                    }
                }
                Some(input) = internal.recv() => {
                    self.apply(input).await;
                }
            }
        }

        if self.registry.lock().await.is_busy() {
            self.apply(CallInput::Hangup).await;
        }
        self.timers.cancel_all();
        info!(user_id = self.machine.local().user_id.0, "call client: stopped");
    }

    async fn apply(&mut self, input: CallInput) -> Disposition {
        let transition = {
            let mut registry = self.registry.lock().await;
            self.machine.step(&mut registry, input, Utc::now())
        };
        for effect in transition.effects {
            self.execute(effect).await;
        }
        transition.disposition
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Send(message) => {
                let session_id = message.session_id;
                let kind = message.kind();
                match self.relay.send(message).await {
                    Ok(()) => debug!(%session_id, kind, "call: signal sent"),
                    Err(err) => warn!(%session_id, kind, error = %err, "call: signal not sent"),
                }
            }
            Effect::StartTimer { session_id, timer } => {
                self.timers.start(timer, session_id, self.internal.clone());
            }
            Effect::CancelTimer(timer) => self.timers.cancel(timer),
            Effect::Negotiate {
                session_id,
                command,
            } => {
                if !self.negotiation.submit(session_id, command) {
                    warn!(%session_id, "call: negotiation worker stopped");
                }
            }
            Effect::Notify(notification) => {
                let _ = self.events.send(notification);
            }
        }
    }
}

fn relay_input(event: RelayEvent) -> Option<CallInput> {
    match event {
        RelayEvent::Message(message) => Some(CallInput::Remote(message)),
        RelayEvent::PeerDisconnected(user_id) => Some(CallInput::PeerDisconnected(user_id)),
        RelayEvent::PeerUnavailable {
            session_id,
            user_id,
        } => Some(CallInput::PeerUnavailable {
            session_id,
            user_id,
        }),
        RelayEvent::Connected => {
            info!("call: relay connected");
            None
        }
        RelayEvent::Disconnected => {
            warn!("call: relay disconnected, relying on call timers");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
