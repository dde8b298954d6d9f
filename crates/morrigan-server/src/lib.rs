pub mod connection;
pub mod host;
pub mod logging;
pub mod openapi;
pub mod reporter;
pub mod session;
pub mod supervisor;

pub use supervisor::{Observer, Supervisor};
