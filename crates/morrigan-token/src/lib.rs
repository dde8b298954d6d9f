mod keys;
mod service;
mod wrap;

pub use keys::KeyMaterial;
pub use service::{Claims, IssueOptions, IssuedToken, TokenService, TokenServiceConfig, VerifyFailureKind, VerifyOutcome};
pub use wrap::{unwrap_agent_token, wrap_agent_token};
