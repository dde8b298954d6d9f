use std::collections::HashMap;
use std::sync::Arc;

use morrigan_core::component::{Component, Environment, Log, MessageHandler};
use morrigan_core::config::ComponentSpec;
use morrigan_core::error::Error;
use morrigan_core::store::{DataStore, StateStore};

/// A message handler keyed by its full `<provider>.<message>` wire name, the
/// session manager's lookup table (§4.5/§4.6's "env.providers").
pub type ProviderMap = HashMap<String, Arc<dyn MessageHandler>>;

pub struct MountedComponent {
    pub name: String,
    pub router: axum::Router,
}

/// Loads configured components, wires a namespaced [`Environment`] per
/// component, mounts each at `/api/<name>`, and dispatches `setup`/
/// `on_shutdown` concurrently so one component's failure never blocks
/// another (§4.6).
pub struct ComponentHost {
    components: Vec<(String, Arc<dyn Component>, ComponentSpec)>,
}

impl ComponentHost {
    pub fn new(components: Vec<(String, Arc<dyn Component>, ComponentSpec)>) -> Self {
        Self { components }
    }

    /// Runs every component's `setup` concurrently. Failures are recorded
    /// per-component rather than propagated, matching the lifecycle's
    /// "still reaches READY" contract.
    pub async fn setup_all(
        &self,
        state: Arc<dyn StateStore>,
        data: Arc<dyn DataStore>,
        base_url: &str,
        server_instance_id: uuid::Uuid,
    ) -> (Vec<MountedComponent>, HashMap<String, Error>, ProviderMap) {
        let futures = self.components.iter().map(|(name, component, spec)| {
            let env = Environment {
                state: state.clone().namespaced(name.clone()),
                data: data.clone().namespaced(name.clone()),
                log: Log::new(name.clone()),
                base_url: base_url.to_string(),
                server_instance_id,
            };
            let component = component.clone();
            let name = name.clone();
            let spec = spec.clone();
            async move {
                let result = component.setup(&spec, env).await;
                (name, component, result)
            }
        });

        let results = futures::future::join_all(futures).await;

        let mut mounted = Vec::with_capacity(results.len());
        let mut errors = HashMap::new();
        let mut providers = ProviderMap::new();

        for (name, component, result) in results {
            match result {
                Ok(router) => {
                    for (message, handler) in component.message_handlers() {
                        providers.insert(format!("{name}.{message}"), handler);
                    }
                    mounted.push(MountedComponent { name, router });
                }
                Err(e) => {
                    tracing::error!(component = %name, error = %e, "component setup failed");
                    errors.insert(name, e);
                }
            }
        }

        (mounted, errors, providers)
    }

    /// Runs every component's `on_shutdown` concurrently, again collecting
    /// per-component failures rather than aborting the rest.
    pub async fn shutdown_all(&self, reason: &str) -> HashMap<String, Error> {
        let futures = self.components.iter().map(|(name, component, _)| {
            let component = component.clone();
            let name = name.clone();
            async move { (name, component.on_shutdown(reason).await) }
        });

        let results = futures::future::join_all(futures).await;
        let mut errors = HashMap::new();
        for (name, result) in results {
            if let Err(e) = result {
                tracing::error!(component = %name, error = %e, "component shutdown failed");
                errors.insert(name, e);
            }
        }
        errors
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components.iter().map(|(name, _, _)| name.clone()).collect()
    }

    pub fn openapi_fragments(&self) -> Vec<serde_json::Value> {
        self.components
            .iter()
            .filter_map(|(_, component, _)| component.openapi())
            .collect()
    }
}
