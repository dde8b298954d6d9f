use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use morrigan_core::component::{Environment, MessageHandler, SessionHandle};
use morrigan_core::error::Result;
use morrigan_core::model::Session;
use morrigan_token::IssueOptions;

use crate::registry::{AgentRegistry, DEFAULT_AGENT_TOKEN_TTL};

/// Handles `client.token.refresh`: issues a fresh token for the calling
/// agent and replies with `client.token.issue`, which implicitly revokes
/// whatever token the agent is currently connected with (§4.4).
pub struct TokenRefreshHandler {
    registry: Arc<AgentRegistry>,
}

impl TokenRefreshHandler {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MessageHandler for TokenRefreshHandler {
    async fn handle(
        &self,
        _message: Value,
        socket: Arc<dyn SessionHandle>,
        session: Session,
        _env: Environment,
    ) -> Result<()> {
        let issued = self
            .registry
            .tokens()
            .issue(&session.agent_id, DEFAULT_AGENT_TOKEN_TTL, IssueOptions::default())
            .await?;
        socket
            .send(json!({
                "type": "client.token.issue",
                "token": morrigan_token::wrap_agent_token(&session.agent_id, &issued.token),
                "expires": issued.record.expires,
            }))
            .await
    }
}

/// Handles `client.state`: records the agent's self-reported lifecycle
/// state verbatim, without interpreting it beyond the `stopped…` prefix
/// check the session manager performs on disconnect.
pub struct ClientStateHandler {
    registry: Arc<AgentRegistry>,
}

impl ClientStateHandler {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MessageHandler for ClientStateHandler {
    async fn handle(
        &self,
        message: Value,
        _socket: Arc<dyn SessionHandle>,
        session: Session,
        _env: Environment,
    ) -> Result<()> {
        let state = message
            .get("state")
            .and_then(Value::as_str)
            .ok_or_else(|| morrigan_core::error::Error::request("client.state requires a `state` string"))?;
        self.registry.record_state(&session.agent_id, state).await
    }
}
