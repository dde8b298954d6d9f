use thiserror::Error;

/// The full set of error kinds any subsystem in the server can raise.
///
/// One enum, shared across crate boundaries, mirrors how a single service
/// usually owns its error type end to end: callers match on `kind()` rather
/// than threading per-module error enums through every layer.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("request error: {0}")]
    Request(String),

    #[error("server configuration error: {0}")]
    ServerConfiguration(String),

    #[error("server failed to commit an authentication record: {0}")]
    ServerAuthCommitFailed(String),

    #[error("server is missing an expected authentication record: {0}")]
    ServerMissingAuthRecord(String),

    #[error("no record found: {0}")]
    NoRecord(String),

    #[error("record is invalid: {0}")]
    InvalidRecord(String),

    #[error("token is invalid: {0}")]
    InvalidToken(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("operation failed: {0}")]
    Failed(String),

    #[error("internal server error: {0}")]
    ServerError(String),
}

impl Error {
    pub fn request(msg: impl Into<String>) -> Self {
        Self::Request(msg.into())
    }

    pub fn server_configuration(msg: impl Into<String>) -> Self {
        Self::ServerConfiguration(msg.into())
    }

    pub fn server_auth_commit_failed(msg: impl Into<String>) -> Self {
        Self::ServerAuthCommitFailed(msg.into())
    }

    pub fn server_missing_auth_record(msg: impl Into<String>) -> Self {
        Self::ServerMissingAuthRecord(msg.into())
    }

    pub fn no_record(msg: impl Into<String>) -> Self {
        Self::NoRecord(msg.into())
    }

    pub fn invalid_record(msg: impl Into<String>) -> Self {
        Self::InvalidRecord(msg.into())
    }

    pub fn invalid_token(msg: impl Into<String>) -> Self {
        Self::InvalidToken(msg.into())
    }

    pub fn authentication_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn server_error(msg: impl Into<String>) -> Self {
        Self::ServerError(msg.into())
    }

    /// The wire tag used in HTTP error bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Request(_) => "requestError",
            Error::ServerConfiguration(_) => "serverConfigurationError",
            Error::ServerAuthCommitFailed(_) => "serverAuthCommitFailed",
            Error::ServerMissingAuthRecord(_) => "serverMissingAuthRecord",
            Error::NoRecord(_) => "noRecordError",
            Error::InvalidRecord(_) => "invalidRecordError",
            Error::InvalidToken(_) => "invalidTokenError",
            Error::AuthenticationFailed(_) => "authenticationFailed",
            Error::Failed(_) => "failed",
            Error::ServerError(_) => "serverError",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_match_wire_names() {
        assert_eq!(Error::request("x").kind(), "requestError");
        assert_eq!(Error::no_record("x").kind(), "noRecordError");
        assert_eq!(Error::invalid_token("x").kind(), "invalidTokenError");
        assert_eq!(Error::server_error("x").kind(), "serverError");
    }

    #[test]
    fn display_includes_message() {
        let e = Error::failed("disk full");
        assert!(e.to_string().contains("disk full"));
    }
}
