use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde_json::{json, Value};
use uuid::Uuid;

use morrigan_core::error::{Error, Result};
use morrigan_core::model::{functions, Authentication, Identity, NAME_FORMAT};
use morrigan_core::store::{DataStore, Filter};
use morrigan_token::{IssueOptions, IssuedToken, TokenService};

use crate::provider::ProviderRegistry;

const IDENTITIES: &str = "identities";
const AUTHENTICATIONS: &str = "authentications";

pub const DEFAULT_OPERATOR_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Default)]
pub struct ValidateOptions {
    pub new_identity: bool,
    pub valid_functions: Option<Vec<String>>,
}

pub struct ValidatedSpec {
    pub name: Option<String>,
    pub auth_type: String,
    pub clean_auth: Value,
    pub functions: Option<Vec<String>>,
}

/// CRUD over operator identities, the password auth provider, and the
/// function (permission) list, per §4.3.
pub struct IdentityService {
    data: Arc<dyn DataStore>,
    providers: ProviderRegistry,
    tokens: Arc<TokenService>,
    bootstrap_admin_password: Option<String>,
    name_re: Regex,
}

impl IdentityService {
    pub fn new(
        data: Arc<dyn DataStore>,
        providers: ProviderRegistry,
        tokens: Arc<TokenService>,
        bootstrap_admin_password: Option<String>,
    ) -> Self {
        Self {
            data,
            providers,
            tokens,
            bootstrap_admin_password,
            name_re: Regex::new(NAME_FORMAT).expect("static regex"),
        }
    }

    pub async fn validate_identity_spec(
        &self,
        details: &Value,
        opts: ValidateOptions,
    ) -> Result<ValidatedSpec> {
        let name = details.get("name").and_then(|v| v.as_str());

        if opts.new_identity {
            let name = name.ok_or_else(|| Error::request("name is required"))?;
            self.check_name_format(name)?;
            let existing = self
                .data
                .find_one(IDENTITIES, &Filter::new().eq("name", name))
                .await?;
            if existing.is_some() {
                return Err(Error::request(format!("identity name already in use: {name}")));
            }
        } else if let Some(name) = name {
            self.check_name_format(name)?;
            let existing = self
                .data
                .find_one(IDENTITIES, &Filter::new().eq("name", name))
                .await?;
            if existing.is_none() {
                return Err(Error::request(format!("no such identity: {name}")));
            }
        }

        let (auth_type, clean_auth) = match details.get("auth") {
            Some(auth) => {
                let auth_type = auth
                    .get("type")
                    .and_then(|t| t.as_str())
                    .ok_or_else(|| Error::request("auth.type is required"))?;
                let provider = self.providers.get(auth_type).ok_or_else(|| {
                    Error::server_configuration(format!("unknown auth type: {auth_type}"))
                })?;
                let clean = provider.validate(auth)?;
                (auth_type.to_string(), clean)
            }
            None if opts.new_identity => {
                return Err(Error::request("auth is required"));
            }
            None => (String::new(), Value::Null),
        };

        let functions = match details.get("functions") {
            Some(Value::Array(arr)) => {
                let mut out = Vec::with_capacity(arr.len());
                for v in arr {
                    let f = v
                        .as_str()
                        .ok_or_else(|| Error::request("functions must be strings"))?;
                    if !self.name_re.is_match(f) {
                        return Err(Error::request(format!("invalid function name: {f}")));
                    }
                    if let Some(valid) = &opts.valid_functions {
                        if !valid.iter().any(|v| v == f) {
                            return Err(Error::request(format!("unknown function: {f}")));
                        }
                    }
                    out.push(f.to_string());
                }
                Some(out)
            }
            Some(_) => return Err(Error::request("functions must be an array")),
            None => None,
        };

        Ok(ValidatedSpec {
            name: name.map(str::to_string),
            auth_type,
            clean_auth,
            functions,
        })
    }

    fn check_name_format(&self, name: &str) -> Result<()> {
        if self.name_re.is_match(name) {
            Ok(())
        } else {
            Err(Error::request(format!("invalid name format: {name}")))
        }
    }

    pub async fn add_identity(&self, details: &Value) -> Result<Identity> {
        let spec = self
            .validate_identity_spec(
                details,
                ValidateOptions {
                    new_identity: true,
                    valid_functions: None,
                },
            )
            .await?;
        let provider = self
            .providers
            .get(&spec.auth_type)
            .expect("validated above");

        let record = provider
            .commit(&spec.clean_auth)
            .map_err(|e| Error::server_auth_commit_failed(e.to_string()))?;

        let auth_id = Uuid::new_v4();
        let authentication = Authentication { id: auth_id, record };
        self.data
            .insert_one(AUTHENTICATIONS, serde_json::to_value(&authentication).map_err(json_err)?)
            .await?;

        let now = Utc::now();
        let identity = Identity {
            id: Uuid::new_v4(),
            name: spec.name.expect("new_identity requires a name"),
            auth_id,
            functions: spec.functions.unwrap_or_default(),
            created: now,
            updated: now,
        };
        self.data
            .insert_one(IDENTITIES, serde_json::to_value(&identity).map_err(json_err)?)
            .await?;
        Ok(identity)
    }

    pub async fn set_identity(
        &self,
        id: Uuid,
        details: &Value,
        allow_security_edit: bool,
    ) -> Result<Identity> {
        let spec = self
            .validate_identity_spec(
                details,
                ValidateOptions {
                    new_identity: false,
                    valid_functions: None,
                },
            )
            .await?;

        let doc = self
            .data
            .find_one(IDENTITIES, &Filter::new().eq("id", id.to_string()))
            .await?
            .ok_or_else(|| Error::request(format!("no such identity: {id}")))?;
        let mut identity: Identity = serde_json::from_value(doc).map_err(json_err)?;

        // `id` and any internal id field are rejected silently: this loop
        // over validated fields never looks at `details["id"]`.
        if details.get("auth").is_some() {
            let provider = self
                .providers
                .get(&spec.auth_type)
                .expect("validated above");
            let record = provider
                .commit(&spec.clean_auth)
                .map_err(|e| Error::server_auth_commit_failed(e.to_string()))?;
            let new_auth_id = Uuid::new_v4();
            self.data
                .insert_one(
                    AUTHENTICATIONS,
                    serde_json::to_value(&Authentication {
                        id: new_auth_id,
                        record,
                    })
                    .map_err(json_err)?,
                )
                .await?;
            let old_auth_id = identity.auth_id;
            identity.auth_id = new_auth_id;
            self.data
                .delete_one(AUTHENTICATIONS, &Filter::new().eq("id", old_auth_id.to_string()))
                .await?;
        }

        if let Some(new_functions) = spec.functions {
            // A self-edit (the `me` endpoint) must not escalate privileges:
            // when not allowed, the field is silently ignored rather than
            // rejected, same as an `id` field would be.
            if allow_security_edit {
                identity.functions = new_functions;
            }
        }

        identity.updated = Utc::now();
        self.data
            .replace_one(
                IDENTITIES,
                &Filter::new().eq("id", id.to_string()),
                serde_json::to_value(&identity).map_err(json_err)?,
            )
            .await?;
        Ok(identity)
    }

    pub async fn remove_identity(&self, id: Uuid) -> Result<()> {
        let doc = self
            .data
            .find_one(IDENTITIES, &Filter::new().eq("id", id.to_string()))
            .await?
            .ok_or_else(|| Error::request(format!("no such identity: {id}")))?;
        let identity: Identity = serde_json::from_value(doc).map_err(json_err)?;

        self.data
            .delete_one(AUTHENTICATIONS, &Filter::new().eq("id", identity.auth_id.to_string()))
            .await?;
        self.data
            .delete_one(IDENTITIES, &Filter::new().eq("id", id.to_string()))
            .await?;
        Ok(())
    }

    pub async fn get_identity(&self, id: Uuid) -> Result<Option<Identity>> {
        let doc = self
            .data
            .find_one(IDENTITIES, &Filter::new().eq("id", id.to_string()))
            .await?;
        doc.map(|d| serde_json::from_value(d).map_err(json_err))
            .transpose()
    }

    pub async fn get_identity_by_name(&self, name: &str) -> Result<Option<Identity>> {
        let doc = self
            .data
            .find_one(IDENTITIES, &Filter::new().eq("name", name))
            .await?;
        doc.map(|d| serde_json::from_value(d).map_err(json_err))
            .transpose()
    }

    pub async fn list_identities(&self) -> Result<Vec<Identity>> {
        let docs = self.data.find(IDENTITIES, &Filter::new()).await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).map_err(json_err))
            .collect()
    }

    /// Validates, fetches the identity by name, fetches its auth record,
    /// delegates verification to the auth provider, and issues an operator
    /// token on success (§4.3).
    pub async fn authenticate(&self, name: &str, offered: &Value) -> Result<(Identity, IssuedToken)> {
        let identity = self
            .get_identity_by_name(name)
            .await?
            .ok_or_else(|| Error::authentication_failed("unknown identity"))?;

        let auth_doc = self
            .data
            .find_one(AUTHENTICATIONS, &Filter::new().eq("id", identity.auth_id.to_string()))
            .await?
            .ok_or_else(|| {
                Error::server_missing_auth_record(format!(
                    "identity {} has no authentication record",
                    identity.id
                ))
            })?;
        let authentication: Authentication = serde_json::from_value(auth_doc).map_err(json_err)?;

        let auth_type = match &authentication.record {
            morrigan_core::model::AuthRecord::Password { .. } => "password",
        };
        let provider = self.providers.get(auth_type).ok_or_else(|| {
            Error::server_configuration(format!("unknown auth type: {auth_type}"))
        })?;
        provider
            .authenticate(&authentication.record, offered)
            .map_err(|_| Error::authentication_failed("invalid credentials"))?;

        let issued = self
            .tokens
            .issue(&identity.id.to_string(), DEFAULT_OPERATOR_TOKEN_TTL, IssueOptions::default())
            .await?;
        Ok((identity, issued))
    }

    /// On an empty identity collection, creates an `admin` identity with
    /// every registered function granted and a password sourced from
    /// configuration (never a hard-coded default, per DESIGN NOTES §9(c)).
    /// If unset, a random password is generated and logged once at `warn`.
    pub async fn bootstrap(&self) -> Result<()> {
        let existing = self.data.find(IDENTITIES, &Filter::new()).await?;
        if !existing.is_empty() {
            return Ok(());
        }

        let password = match &self.bootstrap_admin_password {
            Some(p) => p.clone(),
            None => {
                let generated = generate_bootstrap_password();
                tracing::warn!(
                    password = %generated,
                    "MORRIGAN_BOOTSTRAP_ADMIN_PASSWORD not set; generated a one-time admin password"
                );
                generated
            }
        };

        let details = json!({
            "name": "admin",
            "auth": {"type": "password", "password": password},
            "functions": functions::ALL,
        });
        self.add_identity(&details).await?;
        Ok(())
    }
}

fn generate_bootstrap_password() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 18];
    rand::thread_rng().fill_bytes(&mut bytes);
    use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
    use base64::Engine;
    B64.encode(bytes)
}

fn json_err(e: serde_json::Error) -> Error {
    Error::server_error(format!("serialization failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use morrigan_storage::memory::InMemoryDatabase;
    use morrigan_token::TokenServiceConfig;

    fn make_service() -> IdentityService {
        let data: Arc<dyn DataStore> = Arc::new(InMemoryDatabase::new());
        let tokens = TokenService::new(data.clone(), TokenServiceConfig::default());
        IdentityService::new(data, ProviderRegistry::new(), tokens, Some("bootstrap-pw".into()))
    }

    #[tokio::test]
    async fn bootstrap_creates_admin_once() {
        let svc = make_service();
        svc.bootstrap().await.unwrap();
        let identities = svc.list_identities().await.unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].name, "admin");
        assert!(!identities[0].functions.is_empty());

        svc.bootstrap().await.unwrap();
        let identities = svc.list_identities().await.unwrap();
        assert_eq!(identities.len(), 1, "bootstrap must not run twice");
    }

    #[tokio::test]
    async fn authenticate_succeeds_with_bootstrap_password() {
        let svc = make_service();
        svc.bootstrap().await.unwrap();
        let (identity, _issued) = svc
            .authenticate("admin", &json!({"password": "bootstrap-pw"}))
            .await
            .unwrap();
        assert_eq!(identity.name, "admin");
    }

    #[tokio::test]
    async fn authenticate_fails_with_wrong_password() {
        let svc = make_service();
        svc.bootstrap().await.unwrap();
        let result = svc.authenticate("admin", &json!({"password": "nope"})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn add_identity_rejects_duplicate_name() {
        let svc = make_service();
        let details = json!({"name": "alice", "auth": {"type": "password", "password": "correct-horse"}});
        svc.add_identity(&details).await.unwrap();
        let err = svc.add_identity(&details).await.unwrap_err();
        assert_eq!(err.kind(), "requestError");
    }

    #[tokio::test]
    async fn self_edit_without_security_flag_ignores_functions() {
        let svc = make_service();
        let details = json!({
            "name": "alice",
            "auth": {"type": "password", "password": "correct-horse"},
            "functions": [],
        });
        let identity = svc.add_identity(&details).await.unwrap();

        let updated = svc
            .set_identity(identity.id, &json!({"functions": ["identity.create"]}), false)
            .await
            .unwrap();
        assert!(updated.functions.is_empty());

        let escalated = svc
            .set_identity(identity.id, &json!({"functions": ["identity.create"]}), true)
            .await
            .unwrap();
        assert_eq!(escalated.functions, vec!["identity.create".to_string()]);
    }

    #[tokio::test]
    async fn remove_identity_cascades_to_auth_record() {
        let svc = make_service();
        let details = json!({"name": "bob", "auth": {"type": "password", "password": "correct-horse"}});
        let identity = svc.add_identity(&details).await.unwrap();
        svc.remove_identity(identity.id).await.unwrap();
        assert!(svc.get_identity(identity.id).await.unwrap().is_none());
        let auth_doc = svc
            .data
            .find_one(AUTHENTICATIONS, &Filter::new().eq("id", identity.auth_id.to_string()))
            .await
            .unwrap();
        assert!(auth_doc.is_none());
    }
}
