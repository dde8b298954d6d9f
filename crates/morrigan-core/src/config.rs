use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub port: u16,
    pub secure: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            secure: false,
            cert_path: None,
            key_path: None,
        }
    }
}

impl HttpConfig {
    pub fn from_env() -> Result<Self> {
        let port = env::var("HTTP_PORT")
            .ok()
            .map(|v| v.parse::<u16>())
            .transpose()
            .map_err(|e| Error::server_configuration(format!("HTTP_PORT: {e}")))?
            .unwrap_or(3000);
        let secure = env::var("HTTP_SECURE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let cert_path = env::var("HTTP_CERT_PATH").ok();
        let key_path = env::var("HTTP_KEY_PATH").ok();
        if secure && (cert_path.is_none() || key_path.is_none()) {
            return Err(Error::server_configuration(
                "http.secure requires HTTP_CERT_PATH and HTTP_KEY_PATH",
            ));
        }
        Ok(Self {
            port,
            secure,
            cert_path,
            key_path,
        })
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://localhost:{}", self.port)
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub dbname: String,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let connection_string = env::var("DATABASE_CONNECTION_STRING")
            .unwrap_or_else(|_| "postgres://localhost/morrigan".to_string());
        let dbname = match env::var("DATABASE_DBNAME") {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("database.dbname not set, defaulting to 'test'");
                "test".to_string()
            }
        };
        Self {
            connection_string,
            dbname,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub console: bool,
    pub log_dir: Option<String>,
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            console: true,
            log_dir: None,
            level: "info".to_string(),
        }
    }
}

impl LoggerConfig {
    pub fn from_env() -> Self {
        Self {
            console: env::var("LOGGER_CONSOLE")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            log_dir: env::var("LOGGER_LOG_DIR").ok(),
            level: env::var("LOGGER_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

/// A single entry from the `components` configuration map: the module name
/// to load plus a freeform spec blob passed through to the component's
/// `setup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub module: String,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub logger: LoggerConfig,
    pub state_dir: String,
    pub components: HashMap<String, ComponentSpec>,
    pub bootstrap_admin_password: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let components = match env::var("MORRIGAN_COMPONENTS") {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::server_configuration(format!("MORRIGAN_COMPONENTS: {e}")))?,
            Err(_) => {
                let mut default = HashMap::new();
                default.insert(
                    "identity".to_string(),
                    ComponentSpec {
                        module: "identity".to_string(),
                        providers: vec!["password".to_string()],
                        extra: serde_json::Value::Null,
                    },
                );
                default.insert(
                    "client".to_string(),
                    ComponentSpec {
                        module: "agents".to_string(),
                        providers: vec![],
                        extra: serde_json::Value::Null,
                    },
                );
                default
            }
        };

        Ok(Self {
            http: HttpConfig::from_env()?,
            database: DatabaseConfig::from_env(),
            logger: LoggerConfig::from_env(),
            state_dir: env::var("MORRIGAN_STATE_DIR")
                .unwrap_or_else(|_| "/morrigan.server/state".to_string()),
            components,
            bootstrap_admin_password: env::var("MORRIGAN_BOOTSTRAP_ADMIN_PASSWORD").ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_config_defaults_dbname_to_test() {
        env::remove_var("DATABASE_DBNAME");
        let cfg = DatabaseConfig::from_env();
        assert_eq!(cfg.dbname, "test");
    }

    #[test]
    fn http_config_defaults_to_port_3000() {
        env::remove_var("HTTP_PORT");
        env::remove_var("HTTP_SECURE");
        let cfg = HttpConfig::from_env().unwrap();
        assert_eq!(cfg.port, 3000);
        assert!(!cfg.secure);
    }

    #[test]
    fn http_config_secure_without_certs_is_fatal() {
        env::set_var("HTTP_SECURE", "true");
        env::remove_var("HTTP_CERT_PATH");
        env::remove_var("HTTP_KEY_PATH");
        let result = HttpConfig::from_env();
        env::remove_var("HTTP_SECURE");
        assert!(result.is_err());
    }
}
