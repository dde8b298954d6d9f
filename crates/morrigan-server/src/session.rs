use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use morrigan_agents::AgentRegistry;
use morrigan_core::component::{Environment, Log, MessageHandler, SessionHandle};
use morrigan_core::error::{Error, Result};
use morrigan_core::model::Session;
use morrigan_core::store::{DataStore, Filter, StateStore};

use crate::host::ProviderMap;

const SESSIONS: &str = "connections";
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Header carrying the agent's bearer token on the WebSocket upgrade
/// request, documented per §6's "header field is implementation's choice
/// but must be documented".
pub const AGENT_TOKEN_HEADER: &str = "x-agent-token";

/// Everything the session manager needs to authenticate a connection, route
/// its frames, and report session-scoped state, shared with every accepted
/// session task.
#[derive(Clone)]
pub struct SessionManager {
    data: Arc<dyn DataStore>,
    state: Arc<dyn StateStore>,
    registry: Arc<AgentRegistry>,
    providers: Arc<ProviderMap>,
    server_instance_id: Uuid,
    heartbeat_interval: Duration,
    active: Arc<Mutex<HashMap<Uuid, mpsc::UnboundedSender<Value>>>>,
}

impl SessionManager {
    pub fn new(
        data: Arc<dyn DataStore>,
        state: Arc<dyn StateStore>,
        registry: Arc<AgentRegistry>,
        providers: ProviderMap,
        server_instance_id: Uuid,
    ) -> Self {
        Self {
            data,
            state,
            registry,
            providers: Arc::new(providers),
            server_instance_id,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn environment(&self) -> Environment {
        Environment {
            state: self.state.clone(),
            data: self.data.clone(),
            log: Log::new("session"),
            base_url: String::new(),
            server_instance_id: self.server_instance_id,
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let docs = self.data.find(SESSIONS, &Filter::new()).await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).map_err(|e| Error::server_error(format!("serialization failed: {e}"))))
            .collect()
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        let doc = self
            .data
            .find_one(SESSIONS, &Filter::new().eq("id", session_id.to_string()))
            .await?;
        doc.map(|d| serde_json::from_value(d).map_err(|e| Error::server_error(format!("serialization failed: {e}"))))
            .transpose()
    }

    /// Writes to a live session, per §4.5's `send(sessionId, message)`:
    /// `noSuchConnection` if the session is unknown, `closed` if it is not
    /// both alive and open, `wrongServer` if it belongs to a different
    /// server instance (cross-instance forwarding is out of scope here).
    pub async fn send(&self, session_id: Uuid, message: Value) -> Result<()> {
        let session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::no_record(format!("no such connection: {session_id}")))?;
        if !session.alive || !session.open {
            return Err(Error::failed(format!("connection is closed: {session_id}")));
        }
        if session.server_instance_id != self.server_instance_id {
            return Err(Error::failed(format!(
                "connection {session_id} is held by a different server instance"
            )));
        }
        let sender = self
            .active
            .lock()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| Error::failed(format!("connection is closed: {session_id}")))?;
        sender
            .send(message)
            .map_err(|_| Error::failed(format!("connection is closed: {session_id}")))
    }
}

pub async fn ws_handler(
    State(manager): State<Arc<SessionManager>>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<std::net::SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = match headers.get(AGENT_TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        Some(t) => t.to_string(),
        None => return (StatusCode::FORBIDDEN, "missing agent token header").into_response(),
    };
    let peer_address = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    let agent = match manager.registry.verify_token(&token).await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::info!(error = %e, "agent token verification failed, rejecting upgrade");
            return (StatusCode::FORBIDDEN, "invalid agent token").into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(manager, agent.id, peer_address, socket))
}

async fn handle_socket(manager: Arc<SessionManager>, agent_id: String, peer_address: String, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // At-most-one-session-per-agent (§4.5/§5): reject if a live session
    // already exists; clean up a stale one if found.
    let existing = manager
        .data
        .find_one(SESSIONS, &Filter::new().eq("agentId", agent_id.clone()))
        .await;
    if let Ok(Some(doc)) = existing {
        if let Ok(existing_session) = serde_json::from_value::<Session>(doc) {
            if existing_session.alive {
                tracing::info!(agent_id = %agent_id, "rejecting connection, agent already has a live session");
                let _ = ws_tx
                    .send(Message::Text(
                        json!({"type": "connection.state", "state": "rejected", "reason": "already connected"})
                            .to_string()
                            .into(),
                    ))
                    .await;
                return;
            } else {
                let _ = manager
                    .data
                    .delete_one(SESSIONS, &Filter::new().eq("id", existing_session.id.to_string()))
                    .await;
            }
        }
    }

    let session_id = Uuid::new_v4();
    let mut session = Session {
        id: session_id,
        agent_id: agent_id.clone(),
        server_instance_id: manager.server_instance_id,
        peer_address,
        authenticated: true,
        alive: true,
        open: true,
        last_heartbeat: Utc::now(),
    };
    if persist(&manager.data, &session).await.is_err() {
        return;
    }

    // Re-check for a duplicate insert racing this one (§5's mandated
    // re-check-after-insert mitigation): if another session for this agent
    // has a lexicographically/temporally earlier id, this one backs off.
    if let Ok(rows) = manager.data.find(SESSIONS, &Filter::new().eq("agentId", agent_id.clone())).await {
        let lost_race = rows.into_iter().any(|doc| {
            serde_json::from_value::<Session>(doc)
                .map(|other| other.alive && other.id < session_id)
                .unwrap_or(false)
        });
        if lost_race {
            tracing::info!(agent_id = %agent_id, "lost at-most-one-session race, closing");
            let _ = manager
                .data
                .delete_one(SESSIONS, &Filter::new().eq("id", session_id.to_string()))
                .await;
            return;
        }
    }

    tracing::info!(agent_id = %agent_id, session_id = %session_id, "agent session accepted");

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
    let handle: Arc<dyn SessionHandle> = Arc::new(WsSessionHandle { sender: outbound_tx.clone() });
    manager.active.lock().insert(session_id, outbound_tx.clone());

    let _ = outbound_tx.send(json!({"type": "connection.state", "state": "accepted"}));
    let _ = outbound_tx.send(json!({"type": "capability.report"}));

    let mut heartbeat_alive = true;
    let mut ticker = tokio::time::interval(manager.heartbeat_interval);
    ticker.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        heartbeat_alive = true;
                        session.alive = true;
                        session.last_heartbeat = Utc::now();
                        dispatch_frame(&manager, &text, handle.clone(), &session).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        heartbeat_alive = true;
                        session.alive = true;
                        session.last_heartbeat = Utc::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(message) => {
                        let text = message.to_string();
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if !heartbeat_alive {
                    tracing::warn!(agent_id = %agent_id, session_id = %session_id, "heartbeat miss");
                }
                heartbeat_alive = false;
                session.alive = false;
                let _ = persist(&manager.data, &session).await;
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    manager.active.lock().remove(&session_id);
    session.alive = false;
    session.open = false;
    let _ = persist(&manager.data, &session).await;

    if let Ok(Some(current)) = manager.registry.get_agent(&agent_id).await {
        if !current.last_state.is_graceful_stop() {
            let _ = manager.registry.record_state(&agent_id, "unknown").await;
        }
    }

    tracing::info!(agent_id = %agent_id, session_id = %session_id, "agent session closed");
}

async fn dispatch_frame(manager: &Arc<SessionManager>, text: &str, handle: Arc<dyn SessionHandle>, session: &Session) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unparseable frame");
            return;
        }
    };
    let Some(frame_type) = value.get("type").and_then(Value::as_str) else {
        tracing::debug!("ignoring frame with no `type`");
        return;
    };
    let Some(handler) = manager.providers.get(frame_type) else {
        tracing::debug!(frame_type = %frame_type, "ignoring frame with no registered handler");
        return;
    };
    if let Err(e) = handler.handle(value, handle, session.clone(), manager.environment()).await {
        tracing::warn!(frame_type = %frame_type, error = %e, "message handler failed");
    }
}

async fn persist(data: &Arc<dyn DataStore>, session: &Session) -> Result<()> {
    let doc = serde_json::to_value(session)
        .map_err(|e| Error::server_error(format!("serialization failed: {e}")))?;
    let filter = Filter::new().eq("id", session.id.to_string());
    let replaced = data.replace_one(SESSIONS, &filter, doc.clone()).await?;
    if !replaced {
        data.insert_one(SESSIONS, doc).await?;
    }
    Ok(())
}

struct WsSessionHandle {
    sender: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl SessionHandle for WsSessionHandle {
    async fn send(&self, message: Value) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| Error::failed("session closed"))
    }
}

/// Answers the agent's `capability.report` response by recording the
/// reported capabilities on the agent entity (§4.5's "recorded on the
/// agent").
pub struct CapabilityReportHandler {
    registry: Arc<AgentRegistry>,
}

impl CapabilityReportHandler {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MessageHandler for CapabilityReportHandler {
    async fn handle(
        &self,
        message: Value,
        _socket: Arc<dyn SessionHandle>,
        session: Session,
        _env: Environment,
    ) -> Result<()> {
        let capabilities = message
            .get("capabilities")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::request(format!("invalid capabilities payload: {e}")))?
            .unwrap_or_default();
        self.registry.record_capabilities(&session.agent_id, capabilities).await
    }
}
