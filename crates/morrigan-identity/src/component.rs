use std::sync::Arc;

use async_trait::async_trait;

use morrigan_core::component::{Component, Environment};
use morrigan_core::config::ComponentSpec;
use morrigan_core::error::Result;
use morrigan_token::TokenService;
use serde_json::Value;

use crate::routes::{router, AuthState};
use crate::service::IdentityService;

/// The built-in operator-identity component, mounted at `/api/auth` by the
/// component host (its name is `auth`). The identity service is constructed
/// by the server ahead of time, the same way the client component's registry
/// is (its docstring explains why): other components authenticate operators
/// against this exact instance, so there can only be one.
pub struct IdentityComponent {
    identity: Arc<IdentityService>,
    tokens: Arc<TokenService>,
}

impl IdentityComponent {
    pub fn new(identity: Arc<IdentityService>, tokens: Arc<TokenService>) -> Self {
        Self { identity, tokens }
    }
}

#[async_trait]
impl Component for IdentityComponent {
    fn name(&self) -> &str {
        "auth"
    }

    async fn setup(&self, _spec: &ComponentSpec, env: Environment) -> Result<axum::Router> {
        env.log.info("identity component ready");
        Ok(router(AuthState {
            identity: self.identity.clone(),
            tokens: self.tokens.clone(),
        }))
    }

    fn openapi(&self) -> Option<Value> {
        Some(morrigan_core::openapi::route_fragment(
            "/api/auth",
            &[
                ("", &["post"]),
                ("/identity", &["get", "post"]),
                ("/identity/me", &["get", "patch"]),
                ("/identity/:id", &["get", "patch", "delete"]),
            ],
            &[],
        ))
    }
}
