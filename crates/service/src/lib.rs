//! HTTP surface and process assembly.

pub mod config;
pub mod context;
pub mod routes;

pub use config::{ConfigError, ServiceConfig, WalletSource};
pub use context::build_context;
pub use routes::{AppState, router};
