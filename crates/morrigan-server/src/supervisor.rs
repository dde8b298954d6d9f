use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use morrigan_agents::{AgentRegistry, ClientComponent};
use morrigan_core::component::Component;
use morrigan_core::config::Config;
use morrigan_core::error::{Error, Result};
use morrigan_core::lifecycle::{LifecycleEvent, LifecycleState};
use morrigan_core::store::{DataStore, StateStore};
use morrigan_identity::{AuthState, IdentityComponent, IdentityService, ProviderRegistry};
use morrigan_storage::{Database, InMemoryDatabase};
use morrigan_token::{TokenService, TokenServiceConfig};

use crate::connection::{self, ConnectionHttpState};
use crate::host::ComponentHost;
use crate::logging::{self, LoggingGuard};
use crate::openapi;
use crate::reporter::InstanceReporter;
use crate::session::SessionManager;

/// A lifecycle observer, registered with [`Supervisor::subscribe`]. Per §5's
/// ordering guarantee ("lifecycle events fire in strict state-order"),
/// observers must be non-blocking: they are invoked synchronously while the
/// supervisor holds its transition lock, so a slow observer delays the next
/// state transition.
pub type Observer = Box<dyn Fn(&LifecycleEvent) + Send + Sync>;

struct Inner {
    state: LifecycleState,
    config: Option<Config>,
    logging_guard: Option<LoggingGuard>,
    postgres: Option<Arc<Database>>,
    host: Option<ComponentHost>,
    sessions: Option<Arc<SessionManager>>,
    reporter: Option<InstanceReporter>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    serve_task: Option<JoinHandle<()>>,
    setup_errors: HashMap<String, Error>,
    shutdown_errors: HashMap<String, Error>,
    error: Option<Error>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: LifecycleState::Instanced,
            config: None,
            logging_guard: None,
            postgres: None,
            host: None,
            sessions: None,
            reporter: None,
            shutdown_tx: None,
            serve_task: None,
            setup_errors: HashMap::new(),
            shutdown_errors: HashMap::new(),
            error: None,
        }
    }
}

/// Drives the server state machine (§4.1): `Instanced -> Initializing ->
/// Initialized -> Starting -> StartingConnected -> Started -> Ready ->
/// Stopping -> Stopped`, with a terminal `Error` reachable from any
/// pre-`Ready` state. A single `tokio::sync::Mutex` serializes `setup`/
/// `start`/`stop` against each other, which is also how concurrent `stop`
/// calls collapse to one execution (testable property 6): the second caller
/// blocks until the first's `stop` has already moved the state off `Ready`,
/// at which point its own call is a documented no-op.
pub struct Supervisor {
    inner: Mutex<Inner>,
    observers: std::sync::Mutex<Vec<Observer>>,
    instance_id: Uuid,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            observers: std::sync::Mutex::new(Vec::new()),
            instance_id: Uuid::new_v4(),
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Registers an observer; it receives every transition from this point
    /// forward. Existing observers are never removed (the supervisor has no
    /// unsubscribe — matching the source's fire-and-forget event emitter).
    pub fn subscribe(&self, observer: Observer) {
        self.observers.lock().expect("observer lock poisoned").push(observer);
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.lock().await.state
    }

    pub async fn setup_errors(&self) -> HashMap<String, Error> {
        self.inner.lock().await.setup_errors.clone()
    }

    pub async fn shutdown_errors(&self) -> HashMap<String, Error> {
        self.inner.lock().await.shutdown_errors.clone()
    }

    /// The running session manager, once `Ready`; used by integration tests
    /// that drive sessions directly rather than through the HTTP surface.
    pub async fn sessions(&self) -> Option<Arc<SessionManager>> {
        self.inner.lock().await.sessions.clone()
    }

    fn fire(&self, inner: &mut Inner, state: LifecycleState, error: Option<String>) {
        inner.state = state;
        let event = LifecycleEvent { state, error };
        for observer in self.observers.lock().expect("observer lock poisoned").iter() {
            observer(&event);
        }
    }

    /// Only valid from `Instanced`; rejects if already initializing or
    /// initialized. Loads the logger, component specs, state store, server
    /// info, and HTTP listener config (§4.1).
    pub async fn setup(&self, config: Config) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.setup_locked(&mut inner, config).await
    }

    async fn setup_locked(&self, inner: &mut Inner, config: Config) -> Result<()> {
        if inner.state != LifecycleState::Instanced {
            return Err(Error::server_configuration(format!(
                "setup() is only valid from Instanced, currently {:?}",
                inner.state
            )));
        }
        self.fire(inner, LifecycleState::Initializing, None);

        let guard = logging::init(&config.logger);
        if config.http.secure {
            let cert_ok = config.http.cert_path.as_deref().map(|p| Path::new(p).exists()).unwrap_or(false);
            let key_ok = config.http.key_path.as_deref().map(|p| Path::new(p).exists()).unwrap_or(false);
            if !cert_ok || !key_ok {
                let err = Error::server_configuration("http.secure requires readable cert/key files");
                self.fire(inner, LifecycleState::Error, Some(err.to_string()));
                inner.error = Some(err.clone());
                return Err(err);
            }
        }

        tracing::info!(instance_id = %self.instance_id, "server initializing");
        inner.logging_guard = Some(guard);
        inner.config = Some(config);
        self.fire(inner, LifecycleState::Initialized, None);
        Ok(())
    }

    /// Valid from `Initialized` (auto-`setup`s from `Instanced` if the
    /// caller skipped the explicit call). Opens the data store
    /// (`StartingConnected`), starts the HTTP listener (`Started`), brings
    /// up every component concurrently, installs the OpenAPI endpoint,
    /// starts the instance reporter, then reaches `Ready`.
    pub async fn start(&self, config: Config) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == LifecycleState::Instanced {
            self.setup_locked(&mut inner, config).await?;
        }
        if inner.state != LifecycleState::Initialized {
            return Err(Error::server_configuration(format!(
                "start() is only valid from Initialized, currently {:?}",
                inner.state
            )));
        }

        let config = inner.config.clone().expect("Initialized implies config is set");
        self.fire(&mut inner, LifecycleState::Starting, None);

        let (data, state_store, postgres) = match open_backend(&config).await {
            Ok(v) => v,
            Err(e) => return self.fail(&mut inner, e),
        };
        inner.postgres = postgres;
        self.fire(&mut inner, LifecycleState::StartingConnected, None);

        let tokens = TokenService::new(data.clone(), TokenServiceConfig::default());
        // Built once and shared with `IdentityComponent` below: every other
        // component authenticates operators against this exact instance, so
        // there can only be one (mirrors `AgentRegistry`'s construction just
        // below it).
        let identity_service = Arc::new(IdentityService::new(
            data.clone(),
            ProviderRegistry::new(),
            tokens.clone(),
            config.bootstrap_admin_password.clone(),
        ));
        if let Err(e) = identity_service.bootstrap().await {
            return self.fail(&mut inner, e);
        }
        let auth = AuthState {
            identity: identity_service.clone(),
            tokens: tokens.clone(),
        };
        let agent_registry = Arc::new(AgentRegistry::new(data.clone(), tokens.clone()));

        let components: Vec<(String, Arc<dyn Component>, morrigan_core::config::ComponentSpec)> = vec![
            (
                "auth".to_string(),
                Arc::new(IdentityComponent::new(identity_service.clone(), tokens.clone())) as Arc<dyn Component>,
                config.components.get("identity").cloned().unwrap_or_else(default_spec),
            ),
            (
                "client".to_string(),
                Arc::new(ClientComponent::new(agent_registry.clone(), auth.clone())) as Arc<dyn Component>,
                config.components.get("client").cloned().unwrap_or_else(default_spec),
            ),
        ];
        let host = ComponentHost::new(components);
        let (mounted, setup_errors, mut providers) = host
            .setup_all(state_store.clone(), data.clone(), &config.http.base_url(), self.instance_id)
            .await;
        inner.setup_errors = setup_errors;

        // `capability.report` isn't owned by any one component's message
        // handlers (§4.5): the session manager itself solicits it right
        // after accepting a connection, so its handler is wired in directly
        // rather than mounted through `ComponentHost::message_handlers`.
        providers.insert(
            "capability.report".to_string(),
            Arc::new(crate::session::CapabilityReportHandler::new(agent_registry.clone()))
                as Arc<dyn morrigan_core::component::MessageHandler>,
        );

        let sessions = Arc::new(SessionManager::new(
            data.clone(),
            state_store.clone(),
            agent_registry.clone(),
            providers,
            self.instance_id,
        ));
        inner.sessions = Some(sessions.clone());

        let mut app = Router::new();
        for component in mounted {
            app = app.nest(&format!("/api/{}", component.name), component.router);
        }
        app = app.nest(
            "/api/connection",
            connection::router(ConnectionHttpState {
                sessions: sessions.clone(),
                auth: auth.clone(),
            }),
        );

        let mut openapi_fragments = host.openapi_fragments();
        openapi_fragments.push(connection::openapi_fragment());
        let openapi_json = openapi::aggregate(openapi_fragments);
        let openapi_doc = Arc::new(openapi_json.clone());
        let docs_router = Router::new()
            .route("/api-docs", get(serve_openapi))
            .route("/api-doc/openapi.json", get(serve_openapi))
            .with_state(openapi_doc);
        app = app.merge(docs_router);

        // Swagger-UI wants a typed document rather than the raw JSON we
        // serve above; re-parse it back into `utoipa`'s model. A fragment
        // that failed to merge cleanly still leaves `/api-docs` working, so
        // this only costs the interactive UI, not the machine-readable doc.
        match serde_json::from_value::<utoipa::openapi::OpenApi>(openapi_json) {
            Ok(typed) => {
                app = app.merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", typed));
            }
            Err(e) => {
                tracing::warn!(error = %e, "aggregated OpenAPI document did not round-trip; swagger-ui disabled");
            }
        }
        app = app.layer(TraceLayer::new_for_http());

        let addr = format!("0.0.0.0:{}", config.http.port);
        let listener = match TcpListener::bind(addr.as_str()).await {
            Ok(l) => l,
            Err(e) => return self.fail(&mut inner, Error::server_configuration(format!("bind {addr} failed: {e}"))),
        };
        tracing::info!(%addr, "http listener bound");
        self.fire(&mut inner, LifecycleState::Started, None);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let serve_task = tokio::spawn(async move {
            let graceful = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(graceful)
                .await
            {
                tracing::error!(error = %e, "http server error");
            }
        });
        inner.shutdown_tx = Some(shutdown_tx);
        inner.serve_task = Some(serve_task);
        inner.host = Some(host);

        let mut reporter = InstanceReporter::new(
            data.clone(),
            self.instance_id,
            component_names(&inner),
            serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }),
        );
        if let Err(e) = reporter.start().await {
            return self.fail(&mut inner, e);
        }
        inner.reporter = Some(reporter);

        self.fire(&mut inner, LifecycleState::Ready, None);
        tracing::info!(instance_id = %self.instance_id, "server ready");
        Ok(())
    }

    fn fail(&self, inner: &mut Inner, error: Error) -> Result<()> {
        tracing::error!(error = %error, "lifecycle setup/start failed");
        inner.error = Some(error.clone());
        self.fire(inner, LifecycleState::Error, Some(error.to_string()));
        Err(error)
    }

    /// Valid only from `Ready`; a no-op from any other state, so process-exit
    /// handlers can call it unconditionally (testable property 6). Runs
    /// every component's `on_shutdown` concurrently, closes the HTTP
    /// listener (waiting for in-flight requests), stops the reporter, writes
    /// a final `live=false` instance record, closes the data store, and
    /// emits `stopped`.
    pub async fn stop(&self, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != LifecycleState::Ready {
            return Ok(());
        }
        self.fire(&mut inner, LifecycleState::Stopping, None);
        tracing::info!(reason, "server stopping");

        if let Some(host) = inner.host.take() {
            inner.shutdown_errors = host.shutdown_all(reason).await;
        }
        inner.sessions = None;

        if let Some(tx) = inner.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = inner.serve_task.take() {
            let _ = task.await;
        }

        if let Some(mut reporter) = inner.reporter.take() {
            if let Err(e) = reporter.stop(reason).await {
                tracing::warn!(error = %e, "instance reporter final check-in failed");
            }
        }

        if let Some(db) = inner.postgres.take() {
            db.close().await;
        }

        self.fire(&mut inner, LifecycleState::Stopped, None);
        tracing::info!("server stopped");
        Ok(())
    }
}

/// Serves the aggregated OpenAPI document built once at `Started` (§4.7);
/// mounted under both `/api-docs` and the Swagger-UI-compatible alias
/// `/api-doc/openapi.json`.
async fn serve_openapi(State(docs): State<Arc<serde_json::Value>>) -> Json<serde_json::Value> {
    Json((*docs).clone())
}

fn component_names(inner: &Inner) -> Vec<String> {
    inner
        .host
        .as_ref()
        .map(|h| h.component_names())
        .unwrap_or_default()
}

fn default_spec() -> morrigan_core::config::ComponentSpec {
    morrigan_core::config::ComponentSpec {
        module: String::new(),
        providers: Vec::new(),
        extra: serde_json::Value::Null,
    }
}

async fn open_backend(config: &Config) -> Result<(Arc<dyn DataStore>, Arc<dyn StateStore>, Option<Arc<Database>>)> {
    if config.database.connection_string == "memory" {
        let backend = Arc::new(InMemoryDatabase::new());
        Ok((backend.clone(), backend, None))
    } else {
        let db = Arc::new(Database::from_url(&config.database.connection_string).await?);
        Ok((db.clone(), db.clone(), Some(db)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morrigan_core::config::{DatabaseConfig, HttpConfig, LoggerConfig};
    use std::collections::HashMap as Map;

    fn memory_config(port: u16) -> Config {
        Config {
            http: HttpConfig {
                port,
                secure: false,
                cert_path: None,
                key_path: None,
            },
            database: DatabaseConfig {
                connection_string: "memory".to_string(),
                dbname: "test".to_string(),
            },
            logger: LoggerConfig {
                console: false,
                log_dir: None,
                level: "error".to_string(),
            },
            state_dir: "/tmp/morrigan-test".to_string(),
            components: Map::new(),
            bootstrap_admin_password: Some("bootstrap-pw".to_string()),
        }
    }

    #[tokio::test]
    async fn reaches_ready_then_stops_cleanly() {
        let supervisor = Supervisor::new();
        supervisor.start(memory_config(18080)).await.unwrap();
        assert_eq!(supervisor.state().await, LifecycleState::Ready);

        supervisor.stop("test teardown").await.unwrap();
        assert_eq!(supervisor.state().await, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn stop_from_non_ready_state_is_a_no_op() {
        let supervisor = Supervisor::new();
        supervisor.stop("irrelevant").await.unwrap();
        assert_eq!(supervisor.state().await, LifecycleState::Instanced);
    }

    #[tokio::test]
    async fn concurrent_stop_calls_collapse_to_one_execution() {
        let supervisor = Supervisor::new();
        supervisor.start(memory_config(18081)).await.unwrap();

        let a = supervisor.clone();
        let b = supervisor.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { a.stop("first").await }),
            tokio::spawn(async move { b.stop("second").await }),
        );
        r1.unwrap().unwrap();
        r2.unwrap().unwrap();
        assert_eq!(supervisor.state().await, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn observers_see_every_transition_in_order() {
        let supervisor = Supervisor::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        supervisor.subscribe(Box::new(move |event| {
            seen_clone.lock().unwrap().push(event.state);
        }));

        supervisor.start(memory_config(18082)).await.unwrap();
        supervisor.stop("done").await.unwrap();

        let states = seen.lock().unwrap().clone();
        assert_eq!(
            states,
            vec![
                LifecycleState::Initializing,
                LifecycleState::Initialized,
                LifecycleState::Starting,
                LifecycleState::StartingConnected,
                LifecycleState::Started,
                LifecycleState::Ready,
                LifecycleState::Stopping,
                LifecycleState::Stopped,
            ]
        );
    }
}
