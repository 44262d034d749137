pub mod schema;

pub use schema::{Config, EngineConfig, PersistenceConfig, ServerConfig};
