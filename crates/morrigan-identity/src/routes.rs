use std::sync::Arc;

use axum::extract::{FromRef, Path, State};
use axum::http::{header, request::Parts, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{async_trait, Json, Router};
use axum::extract::FromRequestParts;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use morrigan_core::http::ApiError;
use morrigan_core::model::{functions, Identity};
use morrigan_token::TokenService;

use crate::service::IdentityService;

#[derive(Clone)]
pub struct AuthState {
    pub identity: Arc<IdentityService>,
    pub tokens: Arc<TokenService>,
}

/// An operator resolved from a valid bearer token. Any route requiring a
/// specific function additionally checks `identity.functions` itself; this
/// extractor only establishes "a session exists", matching `/identity/me`'s
/// requirement of "a valid session, never a function name".
pub struct OperatorIdentity(pub Identity);

#[async_trait]
impl<S> FromRequestParts<S> for OperatorIdentity
where
    S: Send + Sync,
    AuthState: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AuthState::from_ref(state);
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::from(morrigan_core::error::Error::authentication_failed(
                "missing Authorization header",
            )))?;
        let token = header_value
            .strip_prefix("bearer ")
            .or_else(|| header_value.strip_prefix("Bearer "))
            .ok_or_else(|| {
                ApiError::from(morrigan_core::error::Error::authentication_failed(
                    "expected a bearer token",
                ))
            })?;
        let verified = state
            .tokens
            .verify(token)
            .await
            .map_err(|_| ApiError::from(morrigan_core::error::Error::authentication_failed("invalid token")))?;
        let id = Uuid::parse_str(&verified.subject)
            .map_err(|_| ApiError::from(morrigan_core::error::Error::authentication_failed("invalid subject")))?;
        let identity = state
            .identity
            .get_identity(id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| {
                ApiError::from(morrigan_core::error::Error::authentication_failed(
                    "identity no longer exists",
                ))
            })?;
        Ok(OperatorIdentity(identity))
    }
}

fn require_function(identity: &Identity, function: &str) -> Result<(), ApiError> {
    if identity.functions.iter().any(|f| f == function) {
        Ok(())
    } else {
        Err(ApiError::from(morrigan_core::error::Error::authentication_failed(format!(
            "missing function: {function}"
        ))))
    }
}

#[derive(Deserialize)]
struct LoginRequest {
    name: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    state: &'static str,
    token: String,
}

#[derive(Serialize)]
struct LoginFailure {
    state: &'static str,
    reason: String,
}

async fn login(State(state): State<AuthState>, Json(req): Json<LoginRequest>) -> Response {
    let offered = serde_json::json!({ "password": req.password });
    match state.identity.authenticate(&req.name, &offered).await {
        Ok((_identity, issued)) => (
            StatusCode::OK,
            Json(LoginResponse {
                state: "success",
                token: issued.token,
            }),
        )
            .into_response(),
        Err(e) => {
            let status = match &e {
                morrigan_core::error::Error::Request(_) => StatusCode::BAD_REQUEST,
                morrigan_core::error::Error::AuthenticationFailed(_) => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(LoginFailure {
                    state: e.kind(),
                    reason: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

#[derive(Serialize)]
struct IdentityView {
    id: Uuid,
    name: String,
    functions: Vec<String>,
    created: chrono::DateTime<chrono::Utc>,
    updated: chrono::DateTime<chrono::Utc>,
}

impl From<Identity> for IdentityView {
    fn from(i: Identity) -> Self {
        Self {
            id: i.id,
            name: i.name,
            functions: i.functions,
            created: i.created,
            updated: i.updated,
        }
    }
}

async fn create_identity(
    State(state): State<AuthState>,
    OperatorIdentity(caller): OperatorIdentity,
    Json(details): Json<Value>,
) -> Result<Response, ApiError> {
    require_function(&caller, functions::IDENTITY_CREATE)?;
    let identity = state.identity.add_identity(&details).await?;
    Ok((StatusCode::CREATED, Json(IdentityView::from(identity))).into_response())
}

async fn list_identities(
    State(state): State<AuthState>,
    OperatorIdentity(caller): OperatorIdentity,
) -> Result<Response, ApiError> {
    require_function(&caller, functions::IDENTITY_GET_ALL)?;
    let identities = state.identity.list_identities().await?;
    let views: Vec<IdentityView> = identities.into_iter().map(IdentityView::from).collect();
    Ok(Json(views).into_response())
}

async fn get_identity(
    State(state): State<AuthState>,
    OperatorIdentity(caller): OperatorIdentity,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    require_function(&caller, functions::IDENTITY_GET_ALL)?;
    match state.identity.get_identity(id).await? {
        Some(identity) => Ok(Json(IdentityView::from(identity)).into_response()),
        None => Ok(morrigan_core::http::not_found(format!("no such identity: {id}"))),
    }
}

async fn update_identity(
    State(state): State<AuthState>,
    OperatorIdentity(caller): OperatorIdentity,
    Path(id): Path<Uuid>,
    Json(details): Json<Value>,
) -> Result<Response, ApiError> {
    require_function(&caller, functions::IDENTITY_UPDATE_ALL)?;
    let identity = state.identity.set_identity(id, &details, true).await?;
    Ok(Json(IdentityView::from(identity)).into_response())
}

async fn delete_identity(
    State(state): State<AuthState>,
    OperatorIdentity(caller): OperatorIdentity,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    require_function(&caller, functions::IDENTITY_DELETE_ALL)?;
    state.identity.remove_identity(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn get_me(OperatorIdentity(caller): OperatorIdentity) -> Response {
    Json(IdentityView::from(caller)).into_response()
}

async fn update_me(
    State(state): State<AuthState>,
    OperatorIdentity(caller): OperatorIdentity,
    Json(details): Json<Value>,
) -> Result<Response, ApiError> {
    // Self-edit must not escalate: `allow_security_edit=false` means a
    // `functions` field in `details` is silently ignored, per §4.3.
    let identity = state.identity.set_identity(caller.id, &details, false).await?;
    Ok(Json(IdentityView::from(identity)).into_response())
}

pub fn router(state: AuthState) -> Router {
    let identity_routes = Router::new()
        .route("/", get(list_identities).post(create_identity))
        .route("/me", get(get_me).patch(update_me))
        .route(
            "/:id",
            get(get_identity).patch(update_identity).delete(delete_identity),
        );

    Router::new()
        .route("/", post(login))
        .nest("/identity", identity_routes)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use morrigan_core::store::DataStore;
    use morrigan_storage::memory::InMemoryDatabase;
    use morrigan_token::TokenServiceConfig;
    use tower::ServiceExt;

    async fn test_state() -> AuthState {
        let data: Arc<dyn DataStore> = Arc::new(InMemoryDatabase::new());
        let tokens = TokenService::new(data.clone(), TokenServiceConfig::default());
        let identity = Arc::new(IdentityService::new(
            data,
            crate::provider::ProviderRegistry::new(),
            tokens.clone(),
            Some("bootstrap-pw".to_string()),
        ));
        identity.bootstrap().await.unwrap();
        AuthState { identity, tokens }
    }

    #[tokio::test]
    async fn login_with_bootstrap_password_succeeds() {
        let state = test_state().await;
        let app = router(state);
        let body = serde_json::json!({"name": "admin", "password": "bootstrap-pw"}).to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn login_with_wrong_password_is_forbidden() {
        let state = test_state().await;
        let app = router(state);
        let body = serde_json::json!({"name": "admin", "password": "nope"}).to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn identity_routes_require_a_bearer_token() {
        let state = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/identity")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
