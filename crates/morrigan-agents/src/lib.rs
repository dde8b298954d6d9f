mod component;
mod messages;
mod registry;
mod routes;

pub use component::ClientComponent;
pub use messages::{ClientStateHandler, TokenRefreshHandler};
pub use registry::{AgentRegistry, ProvisionResult, DEFAULT_AGENT_TOKEN_TTL};
pub use routes::{router, ClientHttpState};
