use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use shared::{
    domain::{SessionId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ServerEvent, SignalingMessage},
};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub mod auth;
pub mod rate_limit;

pub use auth::{
    bearer_token, mint_relay_token, AuthError, CredentialValidator, JwtCredentialValidator,
    RelayTokenConfig,
};
pub use rate_limit::TokenBucket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// The live half of a registered connection. Dropping `events` closes the
/// relay's queue towards that client.
pub struct ConnectionHandle {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("message claims sender {claimed} but connection belongs to {actual}")]
    SenderMismatch { claimed: UserId, actual: UserId },
    #[error("connection {0:?} is no longer registered")]
    StaleConnection(ConnectionId),
    #[error("user {user_id} is not connected")]
    PeerUnavailable {
        session_id: SessionId,
        user_id: UserId,
    },
}

impl RouteError {
    /// Frame reported back to the sender of the failed message.
    pub fn into_event(self) -> ServerEvent {
        match self {
            RouteError::PeerUnavailable {
                session_id,
                user_id,
            } => ServerEvent::PeerUnavailable {
                session_id,
                user_id,
            },
            other @ RouteError::SenderMismatch { .. } => {
                ServerEvent::Error(ApiError::new(ErrorCode::Validation, other.to_string()))
            }
            other @ RouteError::StaleConnection(_) => {
                ServerEvent::Error(ApiError::new(ErrorCode::Unauthorized, other.to_string()))
            }
        }
    }
}

struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    correspondents: HashSet<UserId>,
}

#[derive(Default)]
struct HubState {
    next_connection_id: u64,
    connections: HashMap<UserId, Connection>,
}

/// Maps authenticated users to their live connection and forwards addressed
/// signaling messages without interpreting them.
#[derive(Clone, Default)]
pub struct RelayHub {
    inner: Arc<Mutex<HubState>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for `user_id`. A previous connection of the same
    /// user is replaced and its queue closed; its correspondents carry over.
    pub async fn connect(&self, user_id: UserId) -> ConnectionHandle {
        let (outbound, events) = mpsc::unbounded_channel();
        let mut guard = self.inner.lock().await;
        guard.next_connection_id += 1;
        let connection_id = ConnectionId(guard.next_connection_id);

        let correspondents = match guard.connections.remove(&user_id) {
            Some(previous) => {
                info!(
                    user_id = user_id.0,
                    previous = previous.id.0,
                    replacement = connection_id.0,
                    "relay: replacing existing connection"
                );
                previous.correspondents
            }
            None => HashSet::new(),
        };

        guard.connections.insert(
            user_id,
            Connection {
                id: connection_id,
                outbound,
                correspondents,
            },
        );
        info!(user_id = user_id.0, connection_id = connection_id.0, "relay: connected");

        ConnectionHandle {
            user_id,
            connection_id,
            events,
        }
    }

    pub async fn route(
        &self,
        sender: UserId,
        connection_id: ConnectionId,
        message: SignalingMessage,
    ) -> Result<(), RouteError> {
        if message.from_user_id != sender {
            return Err(RouteError::SenderMismatch {
                claimed: message.from_user_id,
                actual: sender,
            });
        }

        let mut guard = self.inner.lock().await;
        match guard.connections.get(&sender) {
            Some(connection) if connection.id == connection_id => {}
            _ => return Err(RouteError::StaleConnection(connection_id)),
        }

        let recipient_id = message.to_user_id;
        let session_id = message.session_id;
        let kind = message.kind();
        let delivered = match guard.connections.get_mut(&recipient_id) {
            Some(recipient) => {
                let delivered = recipient
                    .outbound
                    .send(ServerEvent::Signal { message })
                    .is_ok();
                if delivered {
                    recipient.correspondents.insert(sender);
                }
                delivered
            }
            None => false,
        };

        if !delivered {
            debug!(
                from = sender.0,
                to = recipient_id.0,
                %session_id,
                kind,
                "relay: recipient unavailable"
            );
            return Err(RouteError::PeerUnavailable {
                session_id,
                user_id: recipient_id,
            });
        }

        if let Some(connection) = guard.connections.get_mut(&sender) {
            connection.correspondents.insert(recipient_id);
        }
        debug!(from = sender.0, to = recipient_id.0, %session_id, kind, "relay: forwarded");
        Ok(())
    }

    /// Removes the connection and tells each still-connected correspondent.
    /// A connection that was already replaced is a no-op. Returns the users
    /// that were notified.
    pub async fn disconnect(&self, user_id: UserId, connection_id: ConnectionId) -> Vec<UserId> {
        let mut guard = self.inner.lock().await;
        let is_current = guard
            .connections
            .get(&user_id)
            .is_some_and(|connection| connection.id == connection_id);
        if !is_current {
            debug!(
                user_id = user_id.0,
                connection_id = connection_id.0,
                "relay: ignoring disconnect of replaced connection"
            );
            return Vec::new();
        }

        let Some(connection) = guard.connections.remove(&user_id) else {
            return Vec::new();
        };

        let mut notified = Vec::new();
        for correspondent in connection.correspondents {
            let Some(peer) = guard.connections.get_mut(&correspondent) else {
                continue;
            };
            peer.correspondents.remove(&user_id);
            if peer
                .outbound
                .send(ServerEvent::PeerDisconnected { user_id })
                .is_ok()
            {
                notified.push(correspondent);
            } else {
                warn!(
                    user_id = correspondent.0,
                    "relay: failed to queue disconnect notification"
                );
            }
        }
        notified.sort();

        info!(
            user_id = user_id.0,
            connection_id = connection_id.0,
            notified = notified.len(),
            "relay: disconnected"
        );
        notified
    }

    pub async fn is_connected(&self, user_id: UserId) -> bool {
        self.inner.lock().await.connections.contains_key(&user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
