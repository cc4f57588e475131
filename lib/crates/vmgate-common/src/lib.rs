pub mod config;
pub mod types;

pub use config::{ConfigError, GatewayConfig, VanityEntry};
pub use types::*;
