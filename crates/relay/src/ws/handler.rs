use super::protocol as ws_protocol;
use crate::access::{AccessController, Admission};
use crate::cache::FileSyncService;
use crate::clients::{blobs::BlobStore, records::RecordStore};
use crate::config::RelayConfig;
use crate::error::{
    request_id_from_headers_or_generate, with_request_id_scope, ErrorCode, RelayError,
};
use crate::handshake::{ConnectParams, HandshakeAuthenticator, Session};
use crate::lock::LockManager;
use crate::protocol;
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::reaper::InactivityReaper;
use crate::registry::WorkspaceRegistry;
use crate::runner::ContainerPool;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use sandpit_common::protocol::ws::WsMessage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: u32 = 262_144;

/// Everything a connection needs, built once in `main` and injected. Tests
/// instantiate independent coordinators by building their own.
#[derive(Clone)]
pub struct CoordinatorState {
    pub(crate) handshake: Arc<HandshakeAuthenticator>,
    pub(crate) access: Arc<AccessController>,
    pub(crate) registry: Arc<WorkspaceRegistry>,
    pub(crate) files: Arc<FileSyncService>,
    pub(crate) containers: Arc<ContainerPool>,
    pub(crate) reaper: Arc<InactivityReaper>,
}

impl CoordinatorState {
    pub fn new(config: &RelayConfig, records: RecordStore, blobs: BlobStore) -> Self {
        let registry = Arc::new(WorkspaceRegistry::new());
        let locks = LockManager::new();
        let containers = Arc::new(ContainerPool::new());
        let save_limiter = RateLimiter::new(RateLimitConfig {
            capacity: config.save_rate_capacity,
            refill_per_sec: config.save_rate_refill_per_sec,
        });
        let files = Arc::new(FileSyncService::new(
            Arc::clone(&registry),
            blobs,
            save_limiter,
            config.max_save_bytes,
        ));
        let reaper = Arc::new(InactivityReaper::new(
            Arc::clone(&registry),
            locks,
            Arc::clone(&containers),
            config.drain_grace,
        ));

        Self {
            handshake: Arc::new(HandshakeAuthenticator::new(records)),
            access: Arc::new(AccessController::new(Arc::clone(&registry))),
            registry,
            files,
            containers,
            reaper,
        }
    }
}

pub fn router(state: CoordinatorState) -> Router {
    Router::new().route("/v1/connect", get(connect)).with_state(state)
}

/// Connection-open endpoint. The whole handshake — parameter validation,
/// protocol negotiation, identity resolution — completes before the upgrade
/// is accepted, so a refused connection never processes a single frame.
async fn connect(
    Query(query): Query<HashMap<String, String>>,
    State(state): State<CoordinatorState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let params = match ConnectParams::from_query(&query) {
        Ok(params) => params,
        Err(handshake_error) => {
            warn!(error = %handshake_error, "refusing connection with malformed handshake");
            return RelayError::new(handshake_error.code(), handshake_error.to_string())
                .into_response();
        }
    };

    if let Err(upgrade_error) = protocol::require_supported(&params.protocol_version) {
        return upgrade_error.into_response();
    }

    info!(
        user_id = %params.user_id,
        workspace_id = %params.workspace_id,
        transport_kind = %params.transport_kind,
        "incoming connection attempt",
    );

    let session = match state.handshake.authenticate(&params).await {
        Ok(session) => session,
        Err(handshake_error) => {
            warn!(
                user_id = %params.user_id,
                workspace_id = %params.workspace_id,
                error = %handshake_error,
                "handshake refused",
            );
            return RelayError::new(handshake_error.code(), handshake_error.to_string())
                .into_response();
        }
    };

    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES as usize)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, handle_socket(state, session, socket)).await;
        })
        .into_response()
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}

async fn handle_socket(state: CoordinatorState, session: Session, mut socket: WebSocket) {
    let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel::<WsMessage>();

    match state.access.admit(&session, outbound_sender.clone()).await {
        Ok(Admission::Owner(admission)) => {
            if admission.drain_cancelled {
                debug!(
                    workspace_id = %session.workspace_id,
                    "owner reconnected, pending teardown cancelled",
                );
            }
        }
        Ok(Admission::Guest) => {}
        Err(denied) => {
            // Open just long enough to deliver the notice; no operation
            // rights are ever granted.
            let _ = ws_protocol::send_ws_message(
                &mut socket,
                &WsMessage::DisableAccess { reason: denied.reason.clone() },
            )
            .await;
            let _ = socket.send(Message::Close(None)).await;
            info!(
                session_id = %session.session_id,
                workspace_id = %session.workspace_id,
                "guest refused: owner not connected",
            );
            return;
        }
    }

    info!(
        session_id = %session.session_id,
        user_id = %session.user_id,
        workspace_id = %session.workspace_id,
        is_owner = session.is_owner,
        "session admitted",
    );

    run_session(&state, &session, &mut socket, outbound_sender, outbound_receiver).await;

    // Disconnect bookkeeping runs on every exit path of the session loop.
    if let Some(departure) = state
        .registry
        .disconnect(&session.workspace_id, session.session_id, session.is_owner)
        .await
    {
        state.reaper.arm(session.workspace_id.clone(), departure.drain_epoch);
    }
    info!(session_id = %session.session_id, "session disconnected");
}

async fn run_session(
    state: &CoordinatorState,
    session: &Session,
    socket: &mut WebSocket,
    outbound_sender: mpsc::UnboundedSender<WsMessage>,
    mut outbound_receiver: mpsc::UnboundedReceiver<WsMessage>,
) {
    let playground = match state.files.ensure_loaded(&session.workspace_id).await {
        Ok(playground) => playground,
        Err(load_error) => {
            error!(
                workspace_id = %session.workspace_id,
                error = %load_error,
                "failed to load playground",
            );
            let _ = ws_protocol::send_ws_message(
                socket,
                &WsMessage::Error {
                    code: ErrorCode::InternalError.as_str().to_owned(),
                    message: "failed to load the playground".to_owned(),
                    retryable: true,
                },
            )
            .await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    // The workspace holds its execution container while loaded; re-grants
    // are idempotent for sessions joining an already-active workspace.
    state.containers.acquire(&session.workspace_id).await;

    let loaded = WsMessage::PlaygroundLoaded {
        files: playground.files,
        files_data: playground.files_data,
        problem_statement: playground.problem_statement,
    };
    if ws_protocol::send_ws_message(socket, &loaded).await.is_err() {
        return;
    }

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS and treats the
    // connection as stale once a full interval plus the pong timeout passes
    // without a pong.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_deadline =
        std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS + HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_deadline {
                    warn!(session_id = %session.session_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        if ws_protocol::send_ws_message(socket, &outbound_message).await.is_err() {
                            break;
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
                                let refusal = WsMessage::Error {
                                    code: ErrorCode::InvalidRequest.as_str().to_owned(),
                                    message: "invalid websocket frame payload".to_owned(),
                                    retryable: false,
                                };
                                if ws_protocol::send_ws_message(socket, &refusal).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };

                        match inbound {
                            WsMessage::SaveFile { file_id, content } => {
                                if file_id.is_empty() {
                                    // saves with no open file are ignored
                                    continue;
                                }
                                if let Err(save_error) = state
                                    .files
                                    .apply_save(session, &file_id, content, &outbound_sender)
                                    .await
                                {
                                    debug!(
                                        session_id = %session.session_id,
                                        file_id = %file_id,
                                        error = %save_error,
                                        "save dropped",
                                    );
                                    let notice = WsMessage::Error {
                                        code: save_error.code().as_str().to_owned(),
                                        message: save_error.to_string(),
                                        retryable: save_error.code().retryable(),
                                    };
                                    if ws_protocol::send_ws_message(socket, &notice).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            _ => {
                                let refusal = WsMessage::Error {
                                    code: ErrorCode::InvalidRequest.as_str().to_owned(),
                                    message: "message type is not accepted from clients".to_owned(),
                                    retryable: false,
                                };
                                if ws_protocol::send_ws_message(socket, &refusal).await.is_err() {
                                    break;
                                }
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
                    Err(socket_error) => {
                        if is_frame_size_violation(&socket_error) {
                            close_frame_too_large(socket).await;
                        }
                        break;
                    }
                }
            }
        }
    }
}
