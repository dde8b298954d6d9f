//! Boots a real `Supervisor` against the in-memory backend and drives it
//! over actual HTTP, the way `control-plane/tests/integration_test.rs` drives
//! a live server rather than calling handlers directly.

use std::collections::HashMap;

use morrigan_core::config::{Config, ComponentSpec, DatabaseConfig, HttpConfig, LoggerConfig};
use morrigan_core::lifecycle::LifecycleState;
use morrigan_server::Supervisor;

fn test_config(port: u16) -> Config {
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
        state_dir: "/tmp/morrigan-http-surface-test".to_string(),
        components: HashMap::<String, ComponentSpec>::new(),
        bootstrap_admin_password: Some("bootstrap-pw".to_string()),
    }
}

#[tokio::test]
async fn unauthenticated_requests_are_rejected_and_login_round_trips() {
    let supervisor = Supervisor::new();
    supervisor.start(test_config(18090)).await.unwrap();

    let client = reqwest::Client::new();
    let base = "http://127.0.0.1:18090";

    // No bearer token: the operator-identity extractor rejects before any
    // handler runs.
    let anon = client.get(format!("{base}/api/auth/identity")).send().await.unwrap();
    assert_eq!(anon.status(), 403);

    // Logging in with the bootstrap admin password succeeds and returns a
    // bearer token usable against the rest of the operator surface.
    let login = client
        .post(format!("{base}/api/auth"))
        .json(&serde_json::json!({"name": "admin", "password": "bootstrap-pw"}))
        .send()
        .await
        .unwrap();
    assert_eq!(login.status(), 200);
    let body: serde_json::Value = login.json().await.unwrap();
    let token = body["token"].as_str().expect("login response carries a token").to_string();

    let me = client
        .get(format!("{base}/api/auth/identity/me"))
        .header("authorization", format!("bearer {token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(me.status(), 200);
    let me_body: serde_json::Value = me.json().await.unwrap();
    assert_eq!(me_body["name"], "admin");

    // A wrong password is a 403, not a 401 or 500.
    let bad_login = client
        .post(format!("{base}/api/auth"))
        .json(&serde_json::json!({"name": "admin", "password": "not-it"}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_login.status(), 403);

    supervisor.stop("test teardown").await.unwrap();
}

#[tokio::test]
async fn openapi_and_swagger_ui_are_reachable_once_ready() {
    let supervisor = Supervisor::new();
    supervisor.start(test_config(18091)).await.unwrap();
    assert_eq!(supervisor.state().await, LifecycleState::Ready);

    let client = reqwest::Client::new();
    let base = "http://127.0.0.1:18091";

    let docs = client.get(format!("{base}/api-docs")).send().await.unwrap();
    assert_eq!(docs.status(), 200);
    let doc_body: serde_json::Value = docs.json().await.unwrap();
    assert!(doc_body["paths"].is_object());
    assert!(doc_body["paths"]["/api/client/provision"]["post"].is_object());
    assert!(doc_body["paths"]["/api/auth/identity/me"]["get"].is_object());
    assert!(doc_body["paths"]["/api/connection"]["get"].is_object());

    let alias = client.get(format!("{base}/api-doc/openapi.json")).send().await.unwrap();
    assert_eq!(alias.status(), 200);

    let swagger = client.get(format!("{base}/swagger-ui")).send().await.unwrap();
    assert!(swagger.status().is_success() || swagger.status().is_redirection());

    supervisor.stop("test teardown").await.unwrap();
}

#[tokio::test]
async fn setup_then_start_is_equivalent_to_start_alone() {
    let supervisor = Supervisor::new();
    supervisor.setup(test_config(18092)).await.unwrap();
    assert_eq!(supervisor.state().await, LifecycleState::Initialized);

    supervisor.start(test_config(18092)).await.unwrap();
    assert_eq!(supervisor.state().await, LifecycleState::Ready);

    supervisor.stop("test teardown").await.unwrap();
    assert_eq!(supervisor.state().await, LifecycleState::Stopped);
}
