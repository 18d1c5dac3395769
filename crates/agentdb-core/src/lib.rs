pub mod config;
pub mod types;

pub use config::{AgentDbConfig, ConfigError, DatabaseConfig};
pub use types::*;
