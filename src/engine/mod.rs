#[allow(clippy::module_inception)]
pub mod engine;
pub mod error;
pub mod listeners;

pub use engine::{Engine, EngineOptions, SessionSeed};
pub use error::EngineError;
pub use listeners::{Listener, ListenerHandle};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::Config;
use crate::persistence::create_snapshot_store;
use crate::stream::HttpTransport;

/// Engine options derived from config. Zero durations disable their limit.
pub fn engine_options(config: &Config) -> EngineOptions {
    let idle = config.engine.idle_timeout_secs;
    let max_age = config.persistence.max_age_secs;
    EngineOptions {
        idle_timeout: (idle > 0).then(|| Duration::from_secs(idle)),
        max_snapshot_age: if max_age == 0 {
            None
        } else {
            i64::try_from(max_age)
                .ok()
                .and_then(chrono::Duration::try_seconds)
        },
    }
}

/// Build an engine talking to the configured server and snapshot store.
pub fn create_engine(config: &Config) -> Result<Engine> {
    let http = Arc::new(HttpTransport::from_config(&config.server)?);
    let store = create_snapshot_store(&config.persistence, &config.state_dir())?;
    Engine::new(http.clone(), http, store, engine_options(config))
}

#[cfg(test)]
mod tests;
