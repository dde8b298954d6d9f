use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ComponentSpec;
use crate::error::Result;
use crate::model::Session;
use crate::store::{DataStore, StateStore};

/// A thin, tracing-backed logger handed to components through their
/// environment. Every call is tagged with the owning component's name so
/// log lines can be attributed without each component repeating it.
#[derive(Clone)]
pub struct Log {
    component: String,
}

impl Log {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn info(&self, msg: &str) {
        tracing::info!(component = %self.component, "{msg}");
    }

    pub fn warn(&self, msg: &str) {
        tracing::warn!(component = %self.component, "{msg}");
    }

    pub fn error(&self, msg: &str) {
        tracing::error!(component = %self.component, "{msg}");
    }

    pub fn debug(&self, msg: &str) {
        tracing::debug!(component = %self.component, "{msg}");
    }
}

/// A handle a message handler can use to write back to the agent that sent
/// the frame it is handling, without depending on the session manager's
/// concrete transport type.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn send(&self, message: Value) -> Result<()>;
}

/// The scoped capabilities handed to a component at `setup` time: delegated
/// state/data stores (already namespaced to the component), a logger, the
/// server's advertised base URL, and read-only server metadata.
#[derive(Clone)]
pub struct Environment {
    pub state: Arc<dyn StateStore>,
    pub data: Arc<dyn DataStore>,
    pub log: Log,
    pub base_url: String,
    pub server_instance_id: uuid::Uuid,
}

/// A session-bus message handler, mounted under `<provider>.messages.<name>`
/// and invoked by the session manager for frames of type `<provider>.<name>`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: Value,
        socket: Arc<dyn SessionHandle>,
        session: Session,
        env: Environment,
    ) -> Result<()>;
}

/// A named plugin contributing routes, an optional OpenAPI fragment, and
/// zero or more session-bus message handlers.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    /// Builds this component's router and performs any first-time setup
    /// (e.g. bootstrapping records). Failures are recorded per-component by
    /// the host, not propagated to the caller.
    async fn setup(&self, spec: &ComponentSpec, env: Environment) -> Result<axum::Router>;

    async fn on_shutdown(&self, _reason: &str) -> Result<()> {
        Ok(())
    }

    /// Message-bus handlers this component contributes, keyed by message
    /// name (without the provider prefix, which is this component's name).
    fn message_handlers(&self) -> Vec<(String, Arc<dyn MessageHandler>)> {
        Vec::new()
    }

    /// An OpenAPI fragment covering this component's own routes, merged into
    /// the aggregate document the server serves at `/api-docs`. `None`
    /// leaves the crawl to contribute [`crate::openapi::undocumented_stub`]
    /// entries for this component's routes instead.
    fn openapi(&self) -> Option<Value> {
        None
    }
}
