pub mod memory;
pub mod postgres;

pub use memory::InMemoryDatabase;
pub use postgres::Database;
