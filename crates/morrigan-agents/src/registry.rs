use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use morrigan_core::error::{Error, Result};
use morrigan_core::model::{Agent, Capability};
use morrigan_core::store::{DataStore, Filter};
use morrigan_token::{unwrap_agent_token, wrap_agent_token, IssueOptions, TokenService};

const AGENTS: &str = "agents";

pub const DEFAULT_AGENT_TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

pub struct ProvisionResult {
    pub agent: Agent,
    /// The agent-id-prefixed wire form, per §6's "Token format".
    pub token: String,
    pub expires: DateTime<Utc>,
}

/// Provisions agent records and their long-lived tokens; verifies them at
/// session start (§4.4).
pub struct AgentRegistry {
    data: Arc<dyn DataStore>,
    tokens: Arc<TokenService>,
}

impl AgentRegistry {
    pub fn new(data: Arc<dyn DataStore>, tokens: Arc<TokenService>) -> Self {
        Self { data, tokens }
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    /// Idempotent by id: an absent agent is created, an existing agent has
    /// its token replaced. Either way a fresh verification record is
    /// issued, implicitly invalidating whatever token preceded it.
    pub async fn provision_client(&self, agent_id: &str) -> Result<ProvisionResult> {
        let existing = self
            .data
            .find_one(AGENTS, &Filter::new().eq("id", agent_id))
            .await?;
        let mut agent = match &existing {
            Some(doc) => serde_json::from_value::<Agent>(doc.clone()).map_err(json_err)?,
            None => Agent::new(agent_id.to_string()),
        };

        let issued = self
            .tokens
            .issue(agent_id, DEFAULT_AGENT_TOKEN_TTL, IssueOptions::default())
            .await?;

        agent.current_token_id = Some(issued.record.id);
        agent.updated = Utc::now();

        if existing.is_some() {
            self.data
                .replace_one(
                    AGENTS,
                    &Filter::new().eq("id", agent_id),
                    serde_json::to_value(&agent).map_err(json_err)?,
                )
                .await?;
        } else {
            self.data
                .insert_one(AGENTS, serde_json::to_value(&agent).map_err(json_err)?)
                .await?;
        }

        Ok(ProvisionResult {
            token: wrap_agent_token(agent_id, &issued.token),
            expires: issued.record.expires,
            agent,
        })
    }

    /// Removes both the agent and its current verification record.
    pub async fn deprovision(&self, agent_id: &str) -> Result<()> {
        self.tokens.revoke(agent_id).await?;
        self.data
            .delete_one(AGENTS, &Filter::new().eq("id", agent_id))
            .await?;
        Ok(())
    }

    /// Verifies a (possibly agent-id-wrapped) bearer token and resolves it
    /// to the agent it names. The wrapping prefix is only a hint; the
    /// actual trust decision always comes from the token service's `kid`
    /// lookup.
    pub async fn verify_token(&self, presented: &str) -> Result<Agent> {
        let (_, jwt) = unwrap_agent_token(presented);
        let verified = self.tokens.verify(jwt).await.map_err(|kind| {
            Error::authentication_failed(format!(
                "token verification failed, record mismatch ({})",
                kind.as_str()
            ))
        })?;

        let agent_id = verified.subject;
        let doc = self
            .data
            .find_one(AGENTS, &Filter::new().eq("id", agent_id.clone()))
            .await?;
        match doc {
            Some(d) => serde_json::from_value(d).map_err(json_err),
            None => Err(Error::authentication_failed(format!(
                "no such agent, ID mismatch: {agent_id}"
            ))),
        }
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>> {
        let doc = self
            .data
            .find_one(AGENTS, &Filter::new().eq("id", agent_id))
            .await?;
        doc.map(|d| serde_json::from_value(d).map_err(json_err))
            .transpose()
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        let docs = self.data.find(AGENTS, &Filter::new()).await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).map_err(json_err))
            .collect()
    }

    pub async fn record_capabilities(&self, agent_id: &str, capabilities: Vec<Capability>) -> Result<()> {
        let Some(mut agent) = self.get_agent(agent_id).await? else {
            return Err(Error::request(format!("no such agent: {agent_id}")));
        };
        agent.capabilities = capabilities;
        agent.updated = Utc::now();
        self.data
            .replace_one(
                AGENTS,
                &Filter::new().eq("id", agent_id),
                serde_json::to_value(&agent).map_err(json_err)?,
            )
            .await?;
        Ok(())
    }

    pub async fn record_state(&self, agent_id: &str, state: &str) -> Result<()> {
        let Some(mut agent) = self.get_agent(agent_id).await? else {
            return Err(Error::request(format!("no such agent: {agent_id}")));
        };
        agent.last_state = morrigan_core::model::AgentState::from_str(state);
        agent.updated = Utc::now();
        self.data
            .replace_one(
                AGENTS,
                &Filter::new().eq("id", agent_id),
                serde_json::to_value(&agent).map_err(json_err)?,
            )
            .await?;
        Ok(())
    }
}

fn json_err(e: serde_json::Error) -> Error {
    Error::server_error(format!("serialization failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use morrigan_storage::memory::InMemoryDatabase;
    use morrigan_token::TokenServiceConfig;

    fn make_registry() -> AgentRegistry {
        let data: Arc<dyn DataStore> = Arc::new(InMemoryDatabase::new());
        let tokens = TokenService::new(data.clone(), TokenServiceConfig::default());
        AgentRegistry::new(data, tokens)
    }

    #[tokio::test]
    async fn provision_is_idempotent_by_id() {
        let registry = make_registry();
        registry.provision_client("c1").await.unwrap();
        registry.provision_client("c1").await.unwrap();
        let agents = registry.list_agents().await.unwrap();
        assert_eq!(agents.len(), 1);
    }

    #[tokio::test]
    async fn reprovisioning_invalidates_the_prior_token() {
        let registry = make_registry();
        let first = registry.provision_client("c1").await.unwrap();
        let second = registry.provision_client("c1").await.unwrap();

        assert!(registry.verify_token(&first.token).await.is_err());
        assert!(registry.verify_token(&second.token).await.is_ok());
    }

    #[tokio::test]
    async fn deprovision_removes_agent_and_token() {
        let registry = make_registry();
        let provisioned = registry.provision_client("c1").await.unwrap();
        registry.deprovision("c1").await.unwrap();
        assert!(registry.get_agent("c1").await.unwrap().is_none());
        assert!(registry.verify_token(&provisioned.token).await.is_err());
    }

    #[tokio::test]
    async fn verify_token_rejects_unknown_agent_after_manual_delete() {
        let registry = make_registry();
        let provisioned = registry.provision_client("c1").await.unwrap();
        registry
            .data
            .delete_one(AGENTS, &Filter::new().eq("id", "c1"))
            .await
            .unwrap();
        let err = registry.verify_token(&provisioned.token).await.unwrap_err();
        assert_eq!(err.kind(), "authenticationFailed");
    }
}
