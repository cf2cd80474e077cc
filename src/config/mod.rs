//! Configuration: schema, file loading, env overrides.

mod load;
mod schema;

use thiserror::Error;

pub use load::{config_path, load, load_from, write_config};
pub use schema::{Config, FileLoggingConfig, LogFormat, LogRotation, LoggingConfig};

use crate::error::{Effect, Transience};

#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("configuration invalid: {reason}")]
    Invalid { reason: String },
}

impl ConfigError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
