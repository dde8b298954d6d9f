use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::Value;
use sha2::Sha512;
use subtle::ConstantTimeEq;

use morrigan_core::error::{Error, Result};
use morrigan_core::model::AuthRecord;

type HmacSha512 = Hmac<Sha512>;

/// A pluggable authentication method. `validate` shape-checks caller input,
/// `commit` derives what actually gets stored (called only when writing,
/// never on reads), and `authenticate` checks offered credentials against a
/// stored record.
pub trait AuthProvider: Send + Sync {
    fn name(&self) -> &str;
    fn validate(&self, details: &Value) -> Result<Value>;
    fn commit(&self, clean_details: &Value) -> Result<AuthRecord>;
    fn authenticate(&self, stored: &AuthRecord, offered: &Value) -> Result<()>;
}

/// Loaded at startup; the built-in `password` provider is always
/// registered, matching every variant of the source this system is based
/// on. Additional providers would register here the same way components
/// register with the component host (§4.6).
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn AuthProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(PasswordProvider));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn AuthProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AuthProvider>> {
        self.providers.get(name).cloned()
    }
}

/// The built-in password provider: a minimum-8-character rule, HMAC-SHA-512
/// with a per-record random salt, constant-time comparison on
/// `authenticate` (§4.3).
pub struct PasswordProvider;

impl PasswordProvider {
    const MIN_LENGTH: usize = 8;

    fn hash(password: &str, salt: &str) -> String {
        let mut mac = HmacSha512::new_from_slice(salt.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(password.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl AuthProvider for PasswordProvider {
    fn name(&self) -> &str {
        "password"
    }

    fn validate(&self, details: &Value) -> Result<Value> {
        let password = details
            .get("password")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::request("auth.password is required"))?;
        if password.len() < Self::MIN_LENGTH {
            return Err(Error::request(format!(
                "password must be at least {} characters",
                Self::MIN_LENGTH
            )));
        }
        Ok(serde_json::json!({ "password": password }))
    }

    fn commit(&self, clean_details: &Value) -> Result<AuthRecord> {
        let password = clean_details
            .get("password")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::server_configuration("missing clean password"))?;
        let mut salt_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = hex::encode(salt_bytes);
        let hash = Self::hash(password, &salt);
        Ok(AuthRecord::Password { salt, hash })
    }

    fn authenticate(&self, stored: &AuthRecord, offered: &Value) -> Result<()> {
        let AuthRecord::Password { salt, hash } = stored;
        let offered_password = offered
            .get("password")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::authentication_failed("password is required"))?;
        let candidate = Self::hash(offered_password, salt);
        if candidate.as_bytes().ct_eq(hash.as_bytes()).into() {
            Ok(())
        } else {
            Err(Error::authentication_failed("invalid credentials"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_short_password() {
        let provider = PasswordProvider;
        let err = provider
            .validate(&serde_json::json!({"password": "short"}))
            .unwrap_err();
        assert_eq!(err.kind(), "requestError");
    }

    #[test]
    fn commit_then_authenticate_round_trips() {
        let provider = PasswordProvider;
        let clean = provider
            .validate(&serde_json::json!({"password": "correct-horse"}))
            .unwrap();
        let record = provider.commit(&clean).unwrap();
        assert!(provider
            .authenticate(&record, &serde_json::json!({"password": "correct-horse"}))
            .is_ok());
        assert!(provider
            .authenticate(&record, &serde_json::json!({"password": "wrong-horse"}))
            .is_err());
    }

    #[test]
    fn commit_uses_a_fresh_salt_each_time() {
        let provider = PasswordProvider;
        let clean = provider
            .validate(&serde_json::json!({"password": "same-password"}))
            .unwrap();
        let a = provider.commit(&clean).unwrap();
        let b = provider.commit(&clean).unwrap();
        let (AuthRecord::Password { salt: salt_a, .. }, AuthRecord::Password { salt: salt_b, .. }) =
            (&a, &b);
        assert_ne!(salt_a, salt_b);
    }
}
