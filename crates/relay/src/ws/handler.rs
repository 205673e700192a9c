// Connection gateway: binds each live WebSocket to at most one
// participant, dispatches inbound RPC-style calls to the registry and
// relay, and drains outbound pushes to the socket.
//
// Each connection is one task; dispatch and disconnect share that task, so
// a call can never be processed after its connection's leave has run.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use cinder_common::protocol::ws::WsMessage;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::protocol as ws_protocol;
use crate::error::{request_id_from_headers_or_generate, with_request_id_scope, ErrorCode};
use crate::metrics;
use crate::registry::{OutboundSender, RegistryError, SessionRegistry};
use crate::relay::MessageRelay;

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: usize = 65_536;

#[derive(Clone)]
pub struct GatewayState {
    registry: Arc<SessionRegistry>,
    relay: MessageRelay,
}

pub fn router(registry: Arc<SessionRegistry>) -> Router {
    let state =
        GatewayState { relay: MessageRelay::new(Arc::clone(&registry)), registry };
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

async fn ws_upgrade(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(state, socket)).await;
    })
}

async fn handle_socket(state: GatewayState, mut socket: WebSocket) {
    let connection_id = Uuid::new_v4();
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<WsMessage>();
    // Session this connection has joined, if any.
    let mut joined: Option<String> = None;

    debug!(connection_id = %connection_id, "websocket connected");

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS, disconnects if no
    // pong arrives within HEARTBEAT_TIMEOUT_MS.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout = std::time::Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(connection_id = %connection_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        let session_ended = matches!(outbound_message, WsMessage::SessionDestroyed);
                        if ws_protocol::send_ws_message(&mut socket, &outbound_message).await.is_err() {
                            break;
                        }
                        if session_ended {
                            // The registry already unbound this connection;
                            // allow a fresh join on the same socket.
                            joined = None;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        let inbound = match ws_protocol::decode_message(&raw_message) {
                            Ok(message) => message,
                            Err(_) => {
                                let frame = error_frame_with(
                                    ErrorCode::ValidationFailed,
                                    "invalid websocket frame payload",
                                );
                                if ws_protocol::send_ws_message(&mut socket, &frame).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };

                        let started_at = Instant::now();
                        let (endpoint, outcome) = dispatch_inbound(
                            &state,
                            connection_id,
                            &mut joined,
                            &outbound_sender,
                            inbound,
                        )
                        .await;
                        metrics::record_ws_request(
                            endpoint,
                            outcome.is_err(),
                            started_at.elapsed().as_millis() as u64,
                        );

                        let reply = match outcome {
                            Ok(Some(reply)) => Some(reply),
                            Ok(None) => None,
                            Err(error_message) => Some(error_message),
                        };
                        if let Some(reply) = reply {
                            if ws_protocol::send_ws_message(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    // Transport-level disconnect: exactly one leave per connection, even
    // when the socket died mid-call. Repeats are a registry no-op.
    if let Err(disconnect_error) = state.registry.leave(connection_id).await {
        warn!(
            connection_id = %connection_id,
            error = %disconnect_error,
            "failed to clean up disconnected connection"
        );
    }
    debug!(connection_id = %connection_id, "websocket disconnected");
}

/// Route one inbound frame. Returns the metrics endpoint label plus either
/// an optional direct reply or an error frame for the caller.
async fn dispatch_inbound(
    state: &GatewayState,
    connection_id: Uuid,
    joined: &mut Option<String>,
    outbound: &OutboundSender,
    inbound: WsMessage,
) -> (&'static str, Result<Option<WsMessage>, WsMessage>) {
    match inbound {
        WsMessage::JoinSession { session_id } => (
            "join_session",
            handle_join(state, connection_id, joined, outbound, session_id).await.map(Some),
        ),
        WsMessage::SendMessage { session_id, ciphertext, iv, wrapped_keys } => {
            let result = async {
                require_joined(joined, &session_id)?;
                state
                    .relay
                    .relay_message(&session_id, connection_id, ciphertext, iv, wrapped_keys)
                    .await
                    .map_err(reject)?;
                Ok(None)
            }
            .await;
            ("send_message", result)
        }
        WsMessage::NotifyTyping { session_id } => {
            let result = async {
                require_joined(joined, &session_id)?;
                state.relay.relay_typing(&session_id, connection_id).await.map_err(reject)?;
                Ok(None)
            }
            .await;
            ("notify_typing", result)
        }
        WsMessage::SharePublicKey { session_id, public_key } => {
            let result = async {
                require_joined(joined, &session_id)?;
                state
                    .relay
                    .relay_public_key(&session_id, connection_id, public_key)
                    .await
                    .map_err(reject)?;
                Ok(None)
            }
            .await;
            ("share_public_key", result)
        }
        WsMessage::DestroySession { session_id } => {
            // Possession of the session id is the sole access control;
            // the caller gets its SessionDestroyed push like everyone else.
            let result =
                state.registry.destroy(&session_id).await.map(|()| None).map_err(reject);
            ("destroy_session", result)
        }
        // Server-to-client frames arriving from a client are not callable.
        _ => (
            "unknown",
            Err(error_frame_with(ErrorCode::ValidationFailed, "unsupported message type")),
        ),
    }
}

async fn handle_join(
    state: &GatewayState,
    connection_id: Uuid,
    joined: &mut Option<String>,
    outbound: &OutboundSender,
    session_id: String,
) -> Result<WsMessage, WsMessage> {
    if joined.is_some() {
        return Err(error_frame(ErrorCode::DuplicateConnection));
    }

    match state.registry.join(&session_id, connection_id, outbound.clone()).await {
        Ok(participant) => {
            *joined = Some(session_id.clone());
            Ok(WsMessage::SessionJoined {
                session_id,
                participant_id: participant.id,
                display_name: participant.display_name,
                avatar_tag: participant.avatar_tag,
            })
        }
        Err(join_error) => Err(reject(join_error)),
    }
}

/// The caller must have joined the session it targets.
fn require_joined(joined: &Option<String>, session_id: &str) -> Result<(), WsMessage> {
    match joined.as_deref() {
        Some(current) if current == session_id => Ok(()),
        _ => Err(error_frame(ErrorCode::NotAParticipant)),
    }
}

fn reject(registry_error: RegistryError) -> WsMessage {
    if let RegistryError::Store(store_error) = &registry_error {
        error!(error = ?store_error, "session store failure during websocket call");
    }
    error_frame(error_code_for(&registry_error))
}

fn error_code_for(registry_error: &RegistryError) -> ErrorCode {
    match registry_error {
        RegistryError::SessionNotFound => ErrorCode::SessionNotFound,
        RegistryError::DuplicateConnection => ErrorCode::DuplicateConnection,
        RegistryError::NotAParticipant => ErrorCode::NotAParticipant,
        RegistryError::Store(_) => ErrorCode::StoreUnavailable,
    }
}

fn error_frame(code: ErrorCode) -> WsMessage {
    error_frame_with(code, code.default_message())
}

fn error_frame_with(code: ErrorCode, message: &str) -> WsMessage {
    WsMessage::Error {
        code: code.as_str().to_string(),
        message: message.to_string(),
        retryable: code.retryable(),
    }
}
