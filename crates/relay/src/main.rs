use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use relay_api::{
    bearer_token, AuthError, ConnectionId, CredentialValidator, JwtCredentialValidator, RelayHub,
    TokenBucket,
};
use serde::Deserialize;
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, ServerEvent},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;

use app_state::{AppState, FrameLimits};
use config::load_settings;

#[derive(Debug, Deserialize)]
struct WsQuery {
    access_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings()?;
    let state = AppState {
        hub: RelayHub::new(),
        validator: Arc::new(JwtCredentialValidator::new(&settings.jwt_secret)),
        limits: FrameLimits {
            max_message_bytes: settings.max_message_bytes,
            rate_limit_per_second: settings.rate_limit_per_second,
        },
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn authenticate(
    validator: &dyn CredentialValidator,
    headers: &HeaderMap,
    query: &WsQuery,
) -> Result<UserId, AuthError> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);
    let token = from_header
        .or(query.access_token.as_deref())
        .ok_or(AuthError::MissingCredential)?;
    validator.validate(token)
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = match authenticate(state.validator.as_ref(), &headers, &q) {
        Ok(user_id) => user_id,
        Err(err) => {
            warn!(error = %err, "relay: rejected websocket upgrade");
            return (
                StatusCode::UNAUTHORIZED,
                Json(ApiError::new(ErrorCode::Unauthorized, err.to_string())),
            )
                .into_response();
        }
    };

    ws.max_message_size(state.limits.max_message_bytes.saturating_mul(2))
        .on_upgrade(move |socket| ws_connection(state, socket, user_id))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();
    let handle = state.hub.connect(user_id).await;
    let connection_id = handle.connection_id;
    let mut events_rx = handle.events;
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    // replaced by a newer connection of the same user
                    None => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(error) => {
                    warn!(%error, "relay: failed to encode frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let mut bucket = TokenBucket::new(state.limits.rate_limit_per_second);
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                if let Some(reply) =
                    handle_frame(&state, user_id, connection_id, &mut bucket, &text).await
                {
                    let _ = reply_tx.send(reply);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    drop(reply_tx);
    send_task.abort();
    state.hub.disconnect(user_id, connection_id).await;
}

/// Handles one inbound frame. Returns the frame to send back to this
/// connection, if any.
async fn handle_frame(
    state: &AppState,
    user_id: UserId,
    connection_id: ConnectionId,
    bucket: &mut TokenBucket,
    text: &str,
) -> Option<ServerEvent> {
    if text.len() > state.limits.max_message_bytes {
        return Some(ServerEvent::Error(ApiError::new(
            ErrorCode::Validation,
            format!("frame exceeds {} bytes", state.limits.max_message_bytes),
        )));
    }
    if !bucket.allow() {
        debug!(user_id = user_id.0, "relay: rate limited");
        return Some(ServerEvent::Error(ApiError::new(
            ErrorCode::RateLimited,
            "too many frames",
        )));
    }

    let request = match serde_json::from_str::<ClientRequest>(text) {
        Ok(request) => request,
        Err(err) => {
            return Some(ServerEvent::Error(ApiError::new(
                ErrorCode::Validation,
                format!("invalid frame: {err}"),
            )));
        }
    };

    match request {
        ClientRequest::Ping => Some(ServerEvent::Pong),
        ClientRequest::Signal { message } => state
            .hub
            .route(user_id, connection_id, message)
            .await
            .err()
            .map(|err| err.into_event()),
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/call_flow_tests.rs"]
mod call_flow_tests;
