//! Host configuration.
//!
//! Handles loading configuration from TOML files and turning it into the
//! settings the plugin runtime is built from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::plugin::{
    AdminConfigStore, ConfigResolver, EnvSource, FileAdminStore, ManagerOptions, MemoryAdminStore,
    ReaderOptions, TrustedKeys, UpgradePolicy,
};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "CAPHOST_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "caphost.toml";

/// Errors loading or applying host configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid { key: key.into(), message: message.into() }
    }
}

/// Host configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Runtime settings
    pub runtime: RuntimeConfig,

    /// Timeouts, in milliseconds
    pub timeouts: TimeoutConfig,

    /// Package verification
    pub security: SecurityConfig,

    /// Administrative config store
    pub admin: AdminConfig,

    /// RPC façade
    pub rpc: RpcConfig,

    /// Static per-plugin settings (`[plugins.<id>]`)
    pub plugins: BTreeMap<String, toml::Table>,
}

/// Runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory scanned by `discover`
    pub plugins_dir: PathBuf,

    /// Parent of per-load scratch directories
    pub scratch_dir: PathBuf,

    /// Version checked against manifest host-version bounds
    pub host_version: String,

    /// Enable plugins as soon as they are READY
    pub auto_enable: bool,

    /// Size cap on packages, packed and unpacked
    pub max_package_bytes: u64,

    /// Extra init attempts after an init timeout
    pub init_retries: u32,

    /// How `upgrade` hands over from the old version
    pub upgrade_policy: UpgradePolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("plugins"),
            scratch_dir: std::env::temp_dir().join("caphost"),
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            auto_enable: false,
            max_package_bytes: 64 * 1024 * 1024,
            init_retries: 1,
            upgrade_policy: UpgradePolicy::default(),
        }
    }
}

/// Timeouts, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub init: u64,
    pub cleanup: u64,
    pub call: u64,
    /// Grace period for in-flight calls when disabling
    pub drain_grace: u64,
    /// Package read, verify and extract
    pub io: u64,
    /// Config resolution
    pub config: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { init: 30_000, cleanup: 10_000, call: 60_000, drain_grace: 5_000, io: 30_000, config: 5_000 }
    }
}

/// Package verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Reject unsigned packages
    pub require_signatures: bool,

    /// Base64 ed25519 public keys
    pub trusted_keys: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self { require_signatures: true, trusted_keys: Vec::new() }
    }
}

/// Administrative config store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Directory of `<id>.json` entries; in-memory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,
}

/// RPC façade settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// TCP address for `serve`; stdio when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
}

impl HostConfig {
    /// Load configuration.
    ///
    /// Looks for config in:
    /// 1. `explicit` (from `--config`)
    /// 2. `$CAPHOST_CONFIG`
    /// 3. `caphost.toml` in current directory
    /// 4. `<config_dir>/caphost/config.toml`
    /// 5. Falls back to defaults
    ///
    /// Returns the config and the file it came from.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            return Ok((Self::load_from_file(path)?, Some(path.to_path_buf())));
        }

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = expand_path(Path::new(&path));
            return Ok((Self::load_from_file(&path)?, Some(path)));
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Ok((Self::load_from_file(&local)?, Some(local)));
        }

        if let Some(global) = Self::config_dir().map(|d| d.join("config.toml")) {
            if global.exists() {
                return Ok((Self::load_from_file(&global)?, Some(global)));
            }
        }

        Ok((Self::default(), None))
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.expand_paths();
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("caphost"))
    }

    fn expand_paths(&mut self) {
        self.runtime.plugins_dir = expand_path(&self.runtime.plugins_dir);
        self.runtime.scratch_dir = expand_path(&self.runtime.scratch_dir);
        self.admin.store_dir = self.admin.store_dir.as_deref().map(expand_path);
    }

    /// Parsed host version.
    pub fn host_version(&self) -> Result<Version, ConfigError> {
        Version::parse(&self.runtime.host_version)
            .map_err(|e| ConfigError::invalid("runtime.host_version", e.to_string()))
    }

    /// Trusted signature keys.
    pub fn trusted_keys(&self) -> Result<TrustedKeys, ConfigError> {
        TrustedKeys::from_base64(&self.security.trusted_keys)
            .map_err(|e| ConfigError::invalid("security.trusted_keys", e.to_string()))
    }

    /// Settings for the package reader.
    pub fn reader_options(&self) -> Result<ReaderOptions, ConfigError> {
        Ok(ReaderOptions {
            max_package_bytes: self.runtime.max_package_bytes,
            require_signatures: self.security.require_signatures,
            trusted_keys: self.trusted_keys()?,
            scratch_dir: self.runtime.scratch_dir.clone(),
            io_timeout: Duration::from_millis(self.timeouts.io),
        })
    }

    /// Settings for the plugin manager.
    pub fn manager_options(&self) -> Result<ManagerOptions, ConfigError> {
        Ok(ManagerOptions {
            host_version: self.host_version()?,
            plugins_dir: self.runtime.plugins_dir.clone(),
            auto_enable: self.runtime.auto_enable,
            init_retries: self.runtime.init_retries,
            upgrade_policy: self.runtime.upgrade_policy,
            init_timeout: Duration::from_millis(self.timeouts.init),
            cleanup_timeout: Duration::from_millis(self.timeouts.cleanup),
            call_timeout: Duration::from_millis(self.timeouts.call),
            drain_grace: Duration::from_millis(self.timeouts.drain_grace),
        })
    }

    /// The admin store described by `[admin]`.
    pub fn admin_store(&self) -> Arc<dyn AdminConfigStore> {
        match &self.admin.store_dir {
            Some(dir) => Arc::new(FileAdminStore::new(dir.clone())),
            None => Arc::new(MemoryAdminStore::new()),
        }
    }

    /// `[plugins.<id>]` tables as JSON objects.
    pub fn plugin_settings(&self) -> Result<BTreeMap<String, Map<String, Value>>, ConfigError> {
        self.plugins
            .iter()
            .map(|(id, table)| match serde_json::to_value(table) {
                Ok(Value::Object(map)) => Ok((id.clone(), map)),
                Ok(_) => Err(ConfigError::invalid(format!("plugins.{id}"), "expected a table")),
                Err(e) => Err(ConfigError::invalid(format!("plugins.{id}"), e.to_string())),
            })
            .collect()
    }

    /// Config resolver over the admin store, `env` and `[plugins.<id>]`.
    pub fn resolver(&self, env: EnvSource) -> Result<ConfigResolver, ConfigError> {
        Ok(ConfigResolver::new(self.admin_store(), env)
            .with_file_settings(self.plugin_settings()?)
            .with_timeout(Duration::from_millis(self.timeouts.config)))
    }
}

/// Expand `~` and environment variables in a path.
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(&raw).as_ref()),
    }
}
