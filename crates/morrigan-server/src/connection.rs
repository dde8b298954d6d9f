use std::sync::Arc;

use axum::extract::{FromRef, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use morrigan_core::http::{not_found, ApiError};
use morrigan_core::model::functions;
use morrigan_identity::{AuthState, OperatorIdentity};

use crate::session::{ws_handler, SessionManager};

/// `/api/connection` state: the session manager plus whatever this process
/// uses to authenticate operators, composed via `FromRef` the same way the
/// client component's HTTP state is.
#[derive(Clone)]
pub struct ConnectionHttpState {
    pub sessions: Arc<SessionManager>,
    pub auth: AuthState,
}

impl FromRef<ConnectionHttpState> for AuthState {
    fn from_ref(state: &ConnectionHttpState) -> Self {
        state.auth.clone()
    }
}

fn require_function(identity: &morrigan_core::model::Identity, function: &str) -> Result<(), ApiError> {
    if identity.functions.iter().any(|f| f == function) {
        Ok(())
    } else {
        Err(ApiError::from(morrigan_core::error::Error::authentication_failed(format!(
            "missing function: {function}"
        ))))
    }
}

#[derive(Serialize)]
struct SessionView {
    id: Uuid,
    #[serde(rename = "agentId")]
    agent_id: String,
    alive: bool,
    open: bool,
    #[serde(rename = "lastHeartbeat")]
    last_heartbeat: chrono::DateTime<chrono::Utc>,
}

impl From<morrigan_core::model::Session> for SessionView {
    fn from(s: morrigan_core::model::Session) -> Self {
        Self {
            id: s.id,
            agent_id: s.agent_id,
            alive: s.alive,
            open: s.open,
            last_heartbeat: s.last_heartbeat,
        }
    }
}

async fn list_connections(
    State(state): State<ConnectionHttpState>,
    OperatorIdentity(caller): OperatorIdentity,
) -> Result<Response, ApiError> {
    require_function(&caller, functions::CONNECTION_GET_ALL)?;
    let sessions = state.sessions.list_sessions().await?;
    let views: Vec<SessionView> = sessions.into_iter().map(SessionView::from).collect();
    Ok(Json(views).into_response())
}

async fn get_connection(
    State(state): State<ConnectionHttpState>,
    OperatorIdentity(caller): OperatorIdentity,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    require_function(&caller, functions::CONNECTION_GET_ALL)?;
    match state.sessions.get_session(id).await? {
        Some(session) => Ok(Json(SessionView::from(session)).into_response()),
        None => Ok(not_found(format!("no such connection: {id}"))),
    }
}

#[derive(Deserialize)]
struct SendRequest {
    message: Value,
}

async fn send_to_connection(
    State(state): State<ConnectionHttpState>,
    OperatorIdentity(caller): OperatorIdentity,
    Path(id): Path<Uuid>,
    Json(req): Json<SendRequest>,
) -> Result<Response, ApiError> {
    require_function(&caller, functions::CONNECTION_SEND)?;
    state.sessions.send(id, req.message).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Mounted at `/api/connection`: operator-facing connection inspection and
/// send, plus the `connect` WebSocket upgrade agents use to open a session
/// (authenticated separately, by bearer token, not by operator session).
pub fn router(state: ConnectionHttpState) -> Router {
    // The WS upgrade authenticates agents by bearer token, not operator
    // session, so it gets its own sub-router with a narrower state type,
    // merged in after both halves are fully applied.
    let ws_routes = Router::new()
        .route("/connect", get(ws_handler))
        .with_state(state.sessions.clone());

    let operator_routes = Router::new()
        .route("/", get(list_connections))
        .route("/:id", get(get_connection))
        .route("/:id/send", post(send_to_connection))
        .with_state(state);

    operator_routes.merge(ws_routes)
}

/// `/api/connection` isn't wired through a [`morrigan_core::component::Component`]
/// (the session manager it depends on is constructed alongside the
/// component host, not inside it), so it contributes its own OpenAPI
/// fragment directly rather than through `ComponentHost::openapi_fragments`.
pub fn openapi_fragment() -> Value {
    morrigan_core::openapi::route_fragment(
        "/api/connection",
        &[
            ("", &["get"]),
            ("/:id", &["get"]),
            ("/:id/send", &["post"]),
            ("/connect", &["get"]),
        ],
        &[],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use morrigan_core::store::DataStore;
    use morrigan_storage::memory::InMemoryDatabase;
    use morrigan_token::{TokenService, TokenServiceConfig};
    use tower::ServiceExt;

    async fn test_state() -> ConnectionHttpState {
        let data: Arc<dyn DataStore> = Arc::new(InMemoryDatabase::new());
        let tokens = TokenService::new(data.clone(), TokenServiceConfig::default());
        let identity = Arc::new(morrigan_identity::IdentityService::new(
            data.clone(),
            morrigan_identity::ProviderRegistry::new(),
            tokens.clone(),
            Some("bootstrap-pw".to_string()),
        ));
        identity.bootstrap().await.unwrap();
        let auth = AuthState { identity, tokens: tokens.clone() };

        let registry = Arc::new(morrigan_agents::AgentRegistry::new(data.clone(), tokens));
        let state_store: Arc<dyn morrigan_core::store::StateStore> =
            Arc::new(morrigan_storage::memory::InMemoryDatabase::new());
        let sessions = Arc::new(SessionManager::new(
            data,
            state_store,
            registry,
            std::collections::HashMap::new(),
            Uuid::new_v4(),
        ));
        ConnectionHttpState { sessions, auth }
    }

    #[tokio::test]
    async fn listing_connections_requires_a_bearer_token() {
        let state = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_connection_id_is_not_found() {
        let state = test_state().await;
        let auth = state.auth.clone();
        let login = auth
            .identity
            .authenticate("admin", &serde_json::json!({"password": "bootstrap-pw"}))
            .await
            .unwrap();
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/{}", Uuid::new_v4()))
                    .header("authorization", format!("bearer {}", login.1.token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
