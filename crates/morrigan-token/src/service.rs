use std::sync::Arc;
use std::time::Duration as StdDuration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use morrigan_core::error::{Error, Result};
use morrigan_core::model::TokenVerificationRecord;
use morrigan_core::store::{DataStore, Filter};

use crate::keys::{decoding_key_from_b64, KeyMaterial};

const COLLECTION: &str = "verification";

/// Default rotation interval (6 hours), the midpoint of the spec's 4-8 hour
/// recommendation.
pub const DEFAULT_ROTATION: StdDuration = StdDuration::from_secs(6 * 3600);
pub const DEFAULT_OPERATOR_TTL: StdDuration = StdDuration::from_secs(30 * 60);
pub const DEFAULT_AGENT_TTL: StdDuration = StdDuration::from_secs(30 * 24 * 3600);

#[derive(Debug, Clone)]
pub struct TokenServiceConfig {
    pub issuer: String,
    /// `None`, or a zero/negative duration, means "regenerate the signing
    /// key after every issuance" per §4.2.
    pub rotation_interval: Option<StdDuration>,
}

impl Default for TokenServiceConfig {
    fn default() -> Self {
        Self {
            issuer: "morrigan".to_string(),
            rotation_interval: Some(DEFAULT_ROTATION),
        }
    }
}

impl TokenServiceConfig {
    fn rotates_per_issuance(&self) -> bool {
        match self.rotation_interval {
            None => true,
            Some(d) => d.is_zero(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct IssueOptions {
    pub context: Option<serde_json::Value>,
}

pub struct IssuedToken {
    pub record: TokenVerificationRecord,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyFailureKind {
    NoRecord,
    InvalidRecord,
    InvalidToken,
}

impl VerifyFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyFailureKind::NoRecord => "noRecordError",
            VerifyFailureKind::InvalidRecord => "invalidRecordError",
            VerifyFailureKind::InvalidToken => "invalidTokenError",
        }
    }
}

pub struct VerifySuccess {
    pub subject: String,
    pub context: Option<serde_json::Value>,
}

pub type VerifyOutcome = std::result::Result<VerifySuccess, VerifyFailureKind>;

/// Issues and verifies asymmetrically-signed bearer tokens. Owns one
/// ECDSA P-256 key pair at a time, swapped atomically on rotation so
/// verification reads never block a concurrent rotation (§5).
pub struct TokenService {
    config: TokenServiceConfig,
    store: Arc<dyn DataStore>,
    keys: Arc<ArcSwap<KeyMaterial>>,
    rotation_task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenService {
    pub fn new(store: Arc<dyn DataStore>, config: TokenServiceConfig) -> Arc<Self> {
        let keys = Arc::new(ArcSwap::from_pointee(KeyMaterial::generate()));
        let service = Arc::new(Self {
            config,
            store,
            keys,
            rotation_task: Mutex::new(None),
        });
        service.clone().spawn_rotation();
        service
    }

    fn spawn_rotation(self: Arc<Self>) {
        let Some(interval) = self.config.rotation_interval else {
            return;
        };
        if interval.is_zero() {
            return;
        }
        let keys = self.keys.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                keys.store(Arc::new(KeyMaterial::generate()));
                tracing::info!("token service rotated signing key");
            }
        });
        // Best-effort: if this races a concurrent `new`, only one handle is
        // kept; the orphaned task is harmless since it only ever rotates
        // the same shared `ArcSwap`.
        if let Ok(mut guard) = self.rotation_task.try_lock() {
            *guard = Some(handle);
        }
    }

    /// Issues a token for `subject`, replacing any prior record for the
    /// same subject (the mechanism by which re-issuing revokes the
    /// predecessor, per §4.2 and testable property 3).
    pub async fn issue(
        &self,
        subject: &str,
        ttl: StdDuration,
        options: IssueOptions,
    ) -> Result<IssuedToken> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let expires = now
            + Duration::from_std(ttl).map_err(|e| Error::request(format!("bad ttl: {e}")))?;
        let key = self.keys.load_full();

        let record = TokenVerificationRecord {
            id,
            issuer: self.config.issuer.clone(),
            subject: subject.to_string(),
            public_key: key.public_key_b64(),
            issued: now,
            expires,
        };

        // Replace-by-subject: remove any existing record for this subject
        // before inserting the new one so property 3 holds unconditionally.
        self.store
            .delete_one(COLLECTION, &Filter::new().eq("subject", subject))
            .await?;
        self.store
            .insert_one(COLLECTION, serde_json::to_value(&record).map_err(to_json_err)?)
            .await?;

        let claims = Claims {
            sub: subject.to_string(),
            iss: self.config.issuer.clone(),
            iat: now.timestamp(),
            exp: expires.timestamp(),
            context: options.context,
        };
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(id.to_string());
        let token = encode(&header, &claims, &key.encoding_key()?)
            .map_err(|e| Error::server_error(format!("token signing failed: {e}")))?;

        if self.config.rotates_per_issuance() {
            self.keys.store(Arc::new(KeyMaterial::generate()));
        }

        Ok(IssuedToken { record, token })
    }

    /// Verifies a token's signature, issuer, subject, and expiry against
    /// its `kid`-selected verification record. Never surfaces raw parser
    /// errors; every failure is a classified kind.
    pub async fn verify(&self, token: &str) -> VerifyOutcome {
        let header =
            decode_header(token).map_err(|_| VerifyFailureKind::InvalidToken)?;
        let kid = header.kid.as_deref().ok_or(VerifyFailureKind::InvalidToken)?;
        let record_id = Uuid::parse_str(kid).map_err(|_| VerifyFailureKind::InvalidToken)?;

        let doc = self
            .store
            .find_one(COLLECTION, &Filter::new().eq("id", record_id.to_string()))
            .await
            .map_err(|_| VerifyFailureKind::NoRecord)?
            .ok_or(VerifyFailureKind::NoRecord)?;
        let record: TokenVerificationRecord =
            serde_json::from_value(doc).map_err(|_| VerifyFailureKind::InvalidRecord)?;

        if record.public_key.is_empty() || record.issuer.is_empty() || record.subject.is_empty() {
            return Err(VerifyFailureKind::InvalidRecord);
        }

        let decoding_key = decoding_key_from_b64(&record.public_key)
            .map_err(|_| VerifyFailureKind::InvalidRecord)?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_issuer(&[&record.issuer]);
        validation.validate_exp = true;

        let data = decode::<Claims>(token, &decoding_key, &validation)
            .map_err(|_| VerifyFailureKind::InvalidToken)?;

        if data.claims.sub != record.subject {
            return Err(VerifyFailureKind::InvalidToken);
        }

        Ok(VerifySuccess {
            subject: data.claims.sub,
            context: data.claims.context,
        })
    }

    /// Removes the verification record for `subject`, if any. Used by the
    /// agent registry's `deprovision` to cascade a delete to the agent's
    /// current token record (§4.4).
    pub async fn revoke(&self, subject: &str) -> Result<()> {
        self.store
            .delete_one(COLLECTION, &Filter::new().eq("subject", subject))
            .await?;
        Ok(())
    }

    /// The public key currently in use, for diagnostics/tests.
    pub fn current_public_key(&self) -> String {
        self.keys.load().public_key_b64()
    }

    pub fn expires_at(&self, issued: &IssuedToken) -> DateTime<Utc> {
        issued.record.expires
    }

    /// Stops key rotation.
    pub async fn dispose(&self) {
        if let Some(handle) = self.rotation_task.lock().await.take() {
            handle.abort();
        }
    }
}

fn to_json_err(e: serde_json::Error) -> Error {
    Error::server_error(format!("serialization failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use morrigan_storage::memory::InMemoryDatabase;

    fn service() -> Arc<TokenService> {
        let store: Arc<dyn DataStore> = Arc::new(InMemoryDatabase::new());
        TokenService::new(
            store,
            TokenServiceConfig {
                issuer: "morrigan".to_string(),
                rotation_interval: Some(StdDuration::from_secs(3600)),
            },
        )
    }

    #[tokio::test]
    async fn issue_then_verify_roundtrips_subject() {
        let svc = service();
        let issued = svc
            .issue("agent-1", StdDuration::from_secs(60), IssueOptions::default())
            .await
            .unwrap();
        let result = svc.verify(&issued.token).await.unwrap();
        assert_eq!(result.subject, "agent-1");
    }

    #[tokio::test]
    async fn reissue_revokes_prior_token() {
        let svc = service();
        let first = svc
            .issue("agent-1", StdDuration::from_secs(60), IssueOptions::default())
            .await
            .unwrap();
        let second = svc
            .issue("agent-1", StdDuration::from_secs(60), IssueOptions::default())
            .await
            .unwrap();

        let first_result = svc.verify(&first.token).await;
        assert!(first_result.is_err());

        let second_result = svc.verify(&second.token).await;
        assert!(second_result.is_ok());
    }

    #[tokio::test]
    async fn verify_rejects_garbage_token() {
        let svc = service();
        let result = svc.verify("not-a-jwt").await;
        assert_eq!(result.unwrap_err(), VerifyFailureKind::InvalidToken);
    }

    #[tokio::test]
    async fn context_round_trips_through_issue_and_verify() {
        let svc = service();
        let issued = svc
            .issue(
                "agent-1",
                StdDuration::from_secs(60),
                IssueOptions {
                    context: Some(serde_json::json!({"scope": "provisioning"})),
                },
            )
            .await
            .unwrap();
        let result = svc.verify(&issued.token).await.unwrap();
        assert_eq!(result.context.unwrap()["scope"], "provisioning");
    }

    #[tokio::test]
    async fn non_positive_rotation_interval_rotates_key_after_every_issuance() {
        let store: Arc<dyn DataStore> = Arc::new(InMemoryDatabase::new());
        let svc = TokenService::new(
            store,
            TokenServiceConfig {
                issuer: "morrigan".to_string(),
                rotation_interval: Some(StdDuration::from_secs(0)),
            },
        );
        let before = svc.current_public_key();
        svc.issue("agent-1", StdDuration::from_secs(60), IssueOptions::default())
            .await
            .unwrap();
        let after = svc.current_public_key();
        assert_ne!(before, after);
    }
}
