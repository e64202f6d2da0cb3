use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::{ApiError, ApiQuery, SharedState};
use super::auth::can_view_project;
use super::db::{BoardDb, DbHandle};
use super::models::*;
use crate::errors::BoardError;

/// How often to send WebSocket Ping frames. The session is re-checked on
/// the same tick.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    ProjectCreated {
        project: Project,
    },
    ProjectUpdated {
        project: Project,
    },
    ProjectDeleted {
        project_id: i64,
    },
    TaskCreated {
        task: Task,
    },
    TaskUpdated {
        task: Task,
    },
    TaskMoved {
        task_id: i64,
        project_id: i64,
        from_status: TaskStatus,
        to_status: TaskStatus,
    },
    TaskDeleted {
        task_id: i64,
        project_id: i64,
    },
    CommentAdded {
        comment: Comment,
        project_id: i64,
    },
    CommentDeleted {
        comment_id: i64,
        task_id: i64,
        project_id: i64,
    },
    PatchNotePublished {
        note: PatchNote,
    },
}

impl WsMessage {
    /// The project an event belongs to. `None` for board-wide events.
    pub fn project_id(&self) -> Option<i64> {
        match self {
            Self::ProjectCreated { project } | Self::ProjectUpdated { project } => Some(project.id),
            Self::TaskCreated { task } | Self::TaskUpdated { task } => Some(task.project_id),
            Self::ProjectDeleted { project_id }
            | Self::TaskMoved { project_id, .. }
            | Self::TaskDeleted { project_id, .. }
            | Self::CommentAdded { project_id, .. }
            | Self::CommentDeleted { project_id, .. } => Some(*project_id),
            Self::PatchNotePublished { .. } => None,
        }
    }
}

// ── Subscriber ───────────────────────────────────────────────────────

/// Whether a broadcast reaches one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Forward,
    Skip,
    /// The session behind the socket is gone.
    Close,
}

/// One socket's listener: its session token and the projects it could see
/// at the last check.
#[derive(Debug)]
pub struct Subscriber {
    token: String,
    user_id: i64,
    /// Needed for `ProjectDeleted`, which arrives after the project and its
    /// membership rows are gone.
    visible: HashSet<i64>,
}

impl Subscriber {
    /// Resolve the token and load the visible projects. `None` when the
    /// session is missing or expired.
    pub fn open(db: &BoardDb, token: String) -> Result<Option<Self>> {
        let mut subscriber = Self {
            token,
            user_id: 0,
            visible: HashSet::new(),
        };
        Ok(subscriber.refresh(db)?.then_some(subscriber))
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    /// Re-resolve the session and reload the visible projects. Returns
    /// `false` after logout, expiry or account deletion.
    pub fn refresh(&mut self, db: &BoardDb) -> Result<bool> {
        let Some(user) = db.get_session_user(&self.token)? else {
            return Ok(false);
        };
        let scope = (!user.is_admin()).then_some(user.id);
        self.user_id = user.id;
        self.visible = db.list_projects(scope)?.into_iter().map(|p| p.id).collect();
        Ok(true)
    }

    /// Decide whether `msg` reaches this socket. The session is resolved
    /// again for every event, and project events need the same visibility
    /// the REST routes require.
    pub fn check(&mut self, db: &BoardDb, msg: &WsMessage) -> Result<Delivery> {
        let Some(user) = db.get_session_user(&self.token)? else {
            return Ok(Delivery::Close);
        };
        let Some(project_id) = msg.project_id() else {
            return Ok(Delivery::Forward);
        };

        let allowed = match msg {
            WsMessage::ProjectDeleted { .. } => {
                self.visible.remove(&project_id) || user.is_admin()
            }
            _ => match db.get_project(project_id)? {
                Some(project) => {
                    let is_member = db.is_member(project_id, user.id)?;
                    can_view_project(&user, &project, is_member)
                }
                None => user.is_admin(),
            },
        };

        if !matches!(msg, WsMessage::ProjectDeleted { .. }) {
            if allowed {
                self.visible.insert(project_id);
            } else {
                self.visible.remove(&project_id);
            }
        }
        Ok(if allowed { Delivery::Forward } else { Delivery::Skip })
    }
}

type SharedSubscriber = Arc<Mutex<Subscriber>>;

async fn screen(db: &DbHandle, subscriber: &SharedSubscriber, msg: WsMessage) -> Result<Delivery> {
    let subscriber = subscriber.clone();
    db.call(move |db| {
        let mut subscriber = subscriber.lock().map_err(|_| BoardError::LockPoisoned)?;
        subscriber.check(db, &msg)
    })
    .await
}

async fn refresh(db: &DbHandle, subscriber: &SharedSubscriber) -> Result<bool> {
    let subscriber = subscriber.clone();
    db.call(move |db| {
        let mut subscriber = subscriber.lock().map_err(|_| BoardError::LockPoisoned)?;
        subscriber.refresh(db)
    })
    .await
}

// ── WebSocket handler ────────────────────────────────────────────────

/// Browsers cannot set headers on a WebSocket handshake, so the session
/// token travels in the query string.
#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// The token is checked before the upgrade is looked at, so a bad token is
/// a plain 401 response.
pub async fn ws_handler(
    State(state): State<SharedState>,
    ApiQuery(params): ApiQuery<WsParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let token = params
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| BoardError::Unauthenticated("Missing token".into()))?;
    let subscriber = state
        .db
        .call(move |db| Subscriber::open(db, token))
        .await?
        .ok_or_else(|| BoardError::Unauthenticated("Session expired or invalid".into()))?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    tracing::debug!(user_id = subscriber.user_id(), "WebSocket upgrade accepted");
    let db = state.db.clone();
    let tx = state.ws_tx.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, tx, db, subscriber)))
}

async fn handle_socket(
    socket: WebSocket,
    tx: broadcast::Sender<String>,
    db: DbHandle,
    subscriber: Subscriber,
) {
    let (sender, receiver) = socket.split();
    let rx = tx.subscribe();
    let user_id = subscriber.user_id();
    tracing::debug!(user_id, "WebSocket client connected");
    run_socket_loop(sender, receiver, rx, db, Arc::new(Mutex::new(subscriber))).await;
    tracing::debug!(user_id, "WebSocket client disconnected");
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines broadcast forwarding, client message receiving, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits. The loop also exits once the
/// subscriber's session no longer resolves.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
    db: DbHandle,
    subscriber: SharedSubscriber,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("WebSocket pong timeout");
                    break;
                }
                match refresh(&db, &subscriber).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!("WebSocket session ended");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "WebSocket session check failed");
                        break;
                    }
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                let raw = match result {
                    Ok(raw) => raw,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "WebSocket subscriber lagged");
                        continue;
                    }
                };
                let msg = match serde_json::from_str::<WsMessage>(&raw) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping unparseable broadcast");
                        continue;
                    }
                };
                match screen(&db, &subscriber, msg).await {
                    Ok(Delivery::Forward) => {
                        if sender.send(Message::Text(raw.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(Delivery::Skip) => {}
                    Ok(Delivery::Close) => {
                        tracing::debug!("WebSocket session ended");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "WebSocket delivery check failed");
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Text, Binary and Ping from the client are ignored
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a WsMessage to all connected WebSocket clients.
/// Returns silently even if no clients are connected.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize WsMessage");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
