//! Host-level building blocks shared by the plugin runtime and the CLI.
//!
//! `config` loads the host TOML file; `retry` provides the backoff helpers
//! used around plugin initialization.

mod config;
mod retry;

pub use config::{
    expand_path, AdminConfig, ConfigError, HostConfig, RpcConfig, RuntimeConfig, SecurityConfig,
    TimeoutConfig, CONFIG_ENV, LOCAL_CONFIG_FILE,
};
pub use retry::{retry_async, retry_async_if, RetryConfig, RetryResult};
