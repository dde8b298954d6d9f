use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use morrigan_core::component::{Component, Environment, MessageHandler};
use morrigan_core::config::ComponentSpec;
use morrigan_core::error::Result;
use morrigan_identity::AuthState;

use crate::messages::{ClientStateHandler, TokenRefreshHandler};
use crate::registry::AgentRegistry;
use crate::routes::{router, ClientHttpState};

/// The built-in client/agent registry component, mounted at `/api/client` by
/// the component host (its name is `client`). The registry is constructed by
/// the server ahead of time (the session manager needs the same instance to
/// authenticate incoming connections), so this component only wires routes
/// and message handlers around it rather than owning it.
pub struct ClientComponent {
    registry: Arc<AgentRegistry>,
    auth: AuthState,
}

impl ClientComponent {
    pub fn new(registry: Arc<AgentRegistry>, auth: AuthState) -> Self {
        Self { registry, auth }
    }
}

#[async_trait]
impl Component for ClientComponent {
    fn name(&self) -> &str {
        "client"
    }

    async fn setup(&self, _spec: &ComponentSpec, env: Environment) -> Result<axum::Router> {
        env.log.info("client component ready");
        Ok(router(ClientHttpState {
            registry: self.registry.clone(),
            auth: self.auth.clone(),
        }))
    }

    fn message_handlers(&self) -> Vec<(String, Arc<dyn MessageHandler>)> {
        vec![
            (
                "token.refresh".to_string(),
                Arc::new(TokenRefreshHandler::new(self.registry.clone())) as Arc<dyn MessageHandler>,
            ),
            (
                "state".to_string(),
                Arc::new(ClientStateHandler::new(self.registry.clone())) as Arc<dyn MessageHandler>,
            ),
        ]
    }

    fn openapi(&self) -> Option<Value> {
        Some(morrigan_core::openapi::route_fragment(
            "/api/client",
            &[
                ("/provision", &["post"]),
                ("", &["get"]),
                ("/:clientId", &["get", "delete"]),
            ],
            &[],
        ))
    }
}
