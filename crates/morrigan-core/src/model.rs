use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Matches identity names, function names, and agent-visible provider names.
pub const NAME_FORMAT: &str = r"^[A-Za-z0-9_.\-]+$";

/// Canonical function (coarse permission) names checked by route guards.
/// Centralized here since both the identity and agent components gate
/// routes on these strings.
pub mod functions {
    pub const IDENTITY_CREATE: &str = "identity.create";
    pub const IDENTITY_GET_ALL: &str = "identity.get.all";
    pub const IDENTITY_UPDATE_ALL: &str = "identity.update.all";
    pub const IDENTITY_DELETE_ALL: &str = "identity.delete.all";
    pub const CLIENT_PROVISION: &str = "client.provision";
    pub const CLIENT_GET_ALL: &str = "client.get.all";
    pub const CLIENT_DELETE_ALL: &str = "client.delete.all";
    pub const CONNECTION_GET_ALL: &str = "connection.get.all";
    pub const CONNECTION_SEND: &str = "connection.send";

    pub const ALL: &[&str] = &[
        IDENTITY_CREATE,
        IDENTITY_GET_ALL,
        IDENTITY_UPDATE_ALL,
        IDENTITY_DELETE_ALL,
        CLIENT_PROVISION,
        CLIENT_GET_ALL,
        CLIENT_DELETE_ALL,
        CONNECTION_GET_ALL,
        CONNECTION_SEND,
    ];
}

/// An operator account: a stable id, a unique name, a link to its
/// authentication record, and an ordered list of coarse permission strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "authId")]
    pub auth_id: Uuid,
    pub functions: Vec<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Sum type over supported authentication methods, stored alongside an
/// Identity but never serialized back out through the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthRecord {
    Password { salt: String, hash: String },
}

/// A full authentication record row, keyed by its own id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authentication {
    pub id: Uuid,
    #[serde(flatten)]
    pub record: AuthRecord,
}

/// One record per token ever issued. Looked up by `id` (verification) or by
/// `subject` (replacement on re-issue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenVerificationRecord {
    pub id: Uuid,
    pub issuer: String,
    pub subject: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub issued: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

/// Lifecycle state an agent last reported through `client.state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentState {
    Unknown,
    Other(String),
}

impl Default for AgentState {
    fn default() -> Self {
        AgentState::Unknown
    }
}

impl AgentState {
    /// `stopped…` prefixed states signal a graceful exit and are left alone
    /// by session cleanup, per §4.5.
    pub fn is_graceful_stop(&self) -> bool {
        match self {
            AgentState::Unknown => false,
            AgentState::Other(s) => s.starts_with("stopped"),
        }
    }

    pub fn from_str(s: &str) -> Self {
        if s == "unknown" {
            AgentState::Unknown
        } else {
            AgentState::Other(s.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AgentState::Unknown => "unknown",
            AgentState::Other(s) => s.as_str(),
        }
    }
}

/// An agent-reported capability descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub version: String,
    pub messages: Vec<String>,
}

/// A provisioned device/process known to the agent registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(rename = "currentTokenId")]
    pub current_token_id: Option<Uuid>,
    #[serde(rename = "lastState")]
    pub last_state: AgentState,
    pub capabilities: Vec<Capability>,
}

impl Agent {
    pub fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            created: now,
            updated: now,
            current_token_id: None,
            last_state: AgentState::Unknown,
            capabilities: Vec::new(),
        }
    }
}

/// A live bidirectional stream bound to one authenticated agent on one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "serverInstanceId")]
    pub server_instance_id: Uuid,
    #[serde(rename = "peerAddress")]
    pub peer_address: String,
    pub authenticated: bool,
    pub alive: bool,
    pub open: bool,
    #[serde(rename = "lastHeartbeat")]
    pub last_heartbeat: DateTime<Utc>,
}

/// Per-server liveness row in the shared `instances` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInstanceRecord {
    pub id: Uuid,
    pub components: Vec<String>,
    #[serde(rename = "runtimeInfo")]
    pub runtime_info: serde_json::Value,
    pub live: bool,
    #[serde(rename = "checkInTime")]
    pub check_in_time: DateTime<Utc>,
    #[serde(rename = "stopReason", skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn name_format_accepts_expected_chars() {
        let re = Regex::new(NAME_FORMAT).unwrap();
        assert!(re.is_match("admin"));
        assert!(re.is_match("agent_01.prod-1"));
        assert!(!re.is_match("has space"));
        assert!(!re.is_match("slash/here"));
    }

    #[test]
    fn agent_state_graceful_stop_detection() {
        assert!(!AgentState::Unknown.is_graceful_stop());
        assert!(AgentState::from_str("stopped-normal").is_graceful_stop());
        assert!(!AgentState::from_str("running").is_graceful_stop());
    }
}
