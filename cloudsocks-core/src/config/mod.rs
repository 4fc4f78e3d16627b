//! Configuration management

pub mod loader;
pub mod schema;
pub mod validator;

pub use loader::ConfigLoader;
pub use schema::{CommonConfig, Config, ProxyConfig, RepositoryConfig, VpnConfig};
pub use validator::ConfigValidator;
