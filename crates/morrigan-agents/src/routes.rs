use std::sync::Arc;

use axum::extract::{FromRef, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use morrigan_core::http::ApiError;
use morrigan_core::model::{functions, Agent};
use morrigan_identity::{AuthState, OperatorIdentity};

use crate::registry::AgentRegistry;

/// Combined router state: the agent registry plus whatever `morrigan-identity`
/// needs to resolve `OperatorIdentity`. Keeping `AuthState` as a field (rather
/// than flattening its members here) lets `OperatorIdentity`'s generic
/// `FromRequestParts` impl pick it up via `FromRef`, the same composition
/// pattern the teacher's `auth/middleware.rs` used for a single concrete
/// state type.
#[derive(Clone)]
pub struct ClientHttpState {
    pub registry: Arc<AgentRegistry>,
    pub auth: AuthState,
}

impl FromRef<ClientHttpState> for AuthState {
    fn from_ref(state: &ClientHttpState) -> Self {
        state.auth.clone()
    }
}

fn require_function(caller: &morrigan_core::model::Identity, function: &str) -> Result<(), ApiError> {
    if caller.functions.iter().any(|f| f == function) {
        Ok(())
    } else {
        Err(ApiError::from(morrigan_core::error::Error::authentication_failed(format!(
            "missing function: {function}"
        ))))
    }
}

#[derive(Deserialize)]
struct ProvisionRequest {
    id: String,
}

#[derive(Serialize)]
struct TokenRecordView {
    id: Uuid,
    expires: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
struct ProvisionResponse {
    token: String,
    record: TokenRecordView,
}

async fn provision(
    State(state): State<ClientHttpState>,
    OperatorIdentity(caller): OperatorIdentity,
    Json(req): Json<ProvisionRequest>,
) -> Result<Response, ApiError> {
    require_function(&caller, functions::CLIENT_PROVISION)?;
    let result = state.registry.provision_client(&req.id).await?;
    Ok((
        StatusCode::OK,
        Json(ProvisionResponse {
            token: result.token,
            record: TokenRecordView {
                id: result.agent.current_token_id.unwrap_or_default(),
                expires: result.expires,
            },
        }),
    )
        .into_response())
}

async fn list_agents(
    State(state): State<ClientHttpState>,
    OperatorIdentity(caller): OperatorIdentity,
) -> Result<Response, ApiError> {
    require_function(&caller, functions::CLIENT_GET_ALL)?;
    let agents: Vec<Agent> = state.registry.list_agents().await?;
    Ok(Json(agents).into_response())
}

async fn get_agent(
    State(state): State<ClientHttpState>,
    OperatorIdentity(caller): OperatorIdentity,
    Path(client_id): Path<String>,
) -> Result<Response, ApiError> {
    require_function(&caller, functions::CLIENT_GET_ALL)?;
    match state.registry.get_agent(&client_id).await? {
        Some(agent) => Ok(Json(agent).into_response()),
        None => Ok(morrigan_core::http::not_found(format!("no such client: {client_id}"))),
    }
}

async fn delete_agent(
    State(state): State<ClientHttpState>,
    OperatorIdentity(caller): OperatorIdentity,
    Path(client_id): Path<String>,
) -> Result<Response, ApiError> {
    require_function(&caller, functions::CLIENT_DELETE_ALL)?;
    state.registry.deprovision(&client_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub fn router(state: ClientHttpState) -> Router {
    Router::new()
        .route("/provision", post(provision))
        .route("/", get(list_agents))
        .route("/:clientId", get(get_agent).delete(delete_agent))
        .with_state(state)
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

    async fn test_state() -> (ClientHttpState, String) {
        let data: Arc<dyn DataStore> = Arc::new(InMemoryDatabase::new());
        let tokens = TokenService::new(data.clone(), TokenServiceConfig::default());
        let identity_service = Arc::new(morrigan_identity::IdentityService::new(
            data.clone(),
            morrigan_identity::ProviderRegistry::new(),
            tokens.clone(),
            Some("bootstrap-pw".to_string()),
        ));
        identity_service.bootstrap().await.unwrap();
        let (_, issued) = identity_service
            .authenticate("admin", &serde_json::json!({"password": "bootstrap-pw"}))
            .await
            .unwrap();

        let registry = Arc::new(AgentRegistry::new(data.clone(), tokens.clone()));
        let auth = AuthState {
            identity: identity_service,
            tokens,
        };
        (ClientHttpState { registry, auth }, issued.token)
    }

    #[tokio::test]
    async fn provisioning_requires_a_bearer_token() {
        let (state, _) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/provision")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::json!({"id": "c1"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn bootstrap_admin_can_provision_and_list() {
        let (state, admin_token) = test_state().await;
        let app = router(state);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/provision")
                    .header("content-type", "application/json")
                    .header("authorization", format!("bearer {admin_token}"))
                    .body(Body::from(serde_json::json!({"id": "c1"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("authorization", format!("bearer {admin_token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
