//! Client side of the signaling relay.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{SessionId, UserId},
    protocol::{ClientRequest, ServerEvent, SignalingMessage},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::RelayClientError;

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Connected,
    Disconnected,
    Message(SignalingMessage),
    PeerDisconnected(UserId),
    PeerUnavailable {
        session_id: SessionId,
        user_id: UserId,
    },
}

/// Outbound half of the relay. Inbound traffic arrives as [`RelayEvent`]s on
/// the receiver handed out when the relay is created.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn send(&self, message: SignalingMessage) -> Result<(), RelayClientError>;
}

/// Websocket relay connection that reconnects after a fixed delay. Messages
/// sent while disconnected fail and are never replayed.
pub struct WsRelayClient {
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    supervisor: JoinHandle<()>,
}

impl WsRelayClient {
    /// Connects to `base_url` (`http(s)://` or `ws(s)://`) and keeps the
    /// connection alive in the background. Fails if the first attempt fails.
    pub async fn connect(
        base_url: &str,
        credential: &str,
        reconnect_delay: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RelayEvent>), RelayClientError> {
        let endpoint = relay_endpoint(base_url)?;
        let socket = open_socket(&endpoint, credential).await?;
        info!(%endpoint, "relay: connected");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let outbound = Arc::new(Mutex::new(None));
        let supervisor = tokio::spawn(supervise(
            socket,
            endpoint,
            credential.to_string(),
            reconnect_delay,
            outbound.clone(),
            events_tx,
        ));

        Ok((
            Self {
                outbound,
                supervisor,
            },
            events_rx,
        ))
    }

    pub async fn is_connected(&self) -> bool {
        self.outbound.lock().await.is_some()
    }
}

impl Drop for WsRelayClient {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[async_trait]
impl SignalingRelay for WsRelayClient {
    async fn send(&self, message: SignalingMessage) -> Result<(), RelayClientError> {
        let frame = serde_json::to_string(&ClientRequest::Signal { message })?;
        let outbound = self.outbound.lock().await;
        let sender = outbound.as_ref().ok_or(RelayClientError::NotConnected)?;
        sender
            .send(frame)
            .map_err(|_| RelayClientError::NotConnected)
    }
}

/// Derives the relay websocket endpoint from a base URL.
pub fn relay_endpoint(base_url: &str) -> Result<Url, RelayClientError> {
    let invalid = |reason: String| RelayClientError::InvalidUrl {
        url: base_url.to_string(),
        reason,
    };

    let mut url = Url::parse(base_url).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme `{other}`"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid("cannot switch to a websocket scheme".into()))?;

    let base_path = url.path().trim_end_matches('/');
    if !base_path.ends_with("/ws") {
        let path = format!("{base_path}/ws");
        url.set_path(&path);
    }
    url.set_query(None);
    Ok(url)
}

async fn open_socket(endpoint: &Url, credential: &str) -> Result<RelaySocket, RelayClientError> {
    let mut request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|err| RelayClientError::Connect(err.to_string()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {credential}"))
        .map_err(|err| RelayClientError::Connect(err.to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (socket, _) = connect_async(request)
        .await
        .map_err(|err| RelayClientError::Connect(err.to_string()))?;
    Ok(socket)
}

async fn supervise(
    mut socket: RelaySocket,
    endpoint: Url,
    credential: String,
    reconnect_delay: Duration,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    loop {
        run_connection(socket, &outbound, &events).await;
        if events.send(RelayEvent::Disconnected).is_err() {
            return;
        }

        socket = loop {
            time::sleep(reconnect_delay).await;
            if events.is_closed() {
                return;
            }
            match open_socket(&endpoint, &credential).await {
                Ok(socket) => {
                    info!(%endpoint, "relay: reconnected");
                    break socket;
                }
                Err(err) => warn!(%endpoint, error = %err, "relay: reconnect failed"),
            }
        };
    }
}

async fn run_connection(
    socket: RelaySocket,
    outbound: &Mutex<Option<mpsc::UnboundedSender<String>>>,
    events: &mpsc::UnboundedSender<RelayEvent>,
) {
    let (mut writer, mut reader) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *outbound.lock().await = Some(tx);
    let _ = events.send(RelayEvent::Connected);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(err) = writer.send(Message::Text(frame)).await {
                    warn!(error = %err, "relay: send failed");
                    break;
                }
            }
            incoming = reader.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = decode_event(&text) {
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "relay: closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "relay: read failed");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    *outbound.lock().await = None;
    info!("relay: disconnected");
}

fn decode_event(text: &str) -> Option<RelayEvent> {
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(ServerEvent::Signal { message }) => Some(RelayEvent::Message(message)),
        Ok(ServerEvent::PeerDisconnected { user_id }) => Some(RelayEvent::PeerDisconnected(user_id)),
        Ok(ServerEvent::PeerUnavailable {
            session_id,
            user_id,
        }) => Some(RelayEvent::PeerUnavailable {
            session_id,
            user_id,
        }),
        Ok(ServerEvent::Pong) => {
            trace!("relay: pong");
            None
        }
        Ok(ServerEvent::Error(error)) => {
            warn!(code = ?error.code, message = %error.message, "relay: error frame");
            None
        }
        Err(err) => {
            warn!(error = %err, "relay: undecodable frame");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
