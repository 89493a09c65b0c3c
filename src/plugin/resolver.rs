//! Per-plugin configuration resolution.
//!
//! Settings are merged from four layers, highest priority first:
//! the admin store, the process environment (`PLUGIN_<ID>_<KEY>`), the
//! static host configuration file, and schema defaults. A lower layer only
//! fills keys the layers above left absent. The merge is validated against
//! the plugin's schema and re-derived on every load and reload.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::manifest::is_valid_id;
use super::{ConfigSchema, PluginError, PluginResult};

/// Layer a resolved setting came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Admin,
    Env,
    File,
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Admin => "admin",
            Self::Env => "env",
            Self::File => "file",
            Self::Default => "default",
        };
        f.write_str(name)
    }
}

/// Validated settings for one plugin, with per-key provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    plugin_id: String,
    settings: Map<String, Value>,
    provenance: BTreeMap<String, ConfigSource>,
    resolved_at: DateTime<Utc>,
}

impl ResolvedConfig {
    /// Build a config directly from settings, all attributed to the admin layer.
    pub fn from_settings(plugin_id: impl Into<String>, settings: Map<String, Value>) -> Self {
        let provenance = settings.keys().map(|k| (k.clone(), ConfigSource::Admin)).collect();
        Self { plugin_id: plugin_id.into(), settings, provenance, resolved_at: Utc::now() }
    }

    /// Plugin this config belongs to.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// All settings.
    pub fn settings(&self) -> &Map<String, Value> {
        &self.settings
    }

    /// Layer each key came from.
    pub fn provenance(&self) -> &BTreeMap<String, ConfigSource> {
        &self.provenance
    }

    /// When the config was resolved.
    pub fn resolved_at(&self) -> DateTime<Utc> {
        self.resolved_at
    }

    /// Get a setting.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    /// Get a string setting.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Get an integer setting.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    /// Get a number setting.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    /// Get a boolean setting.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Layer a key came from.
    pub fn source_of(&self, key: &str) -> Option<ConfigSource> {
        self.provenance.get(key).copied()
    }
}

/// Persisted administrative configuration for one plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdminEntry {
    #[serde(default)]
    pub settings: Map<String, Value>,
    /// Whether the plugin should be enabled after it reaches READY.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Store for administrative plugin configuration.
pub trait AdminConfigStore: Send + Sync + fmt::Debug {
    /// Load the entry for a plugin.
    fn load(&self, plugin_id: &str) -> PluginResult<Option<AdminEntry>>;

    /// Replace the entry for a plugin.
    fn save(&self, plugin_id: &str, entry: &AdminEntry) -> PluginResult<()>;

    /// Delete the entry for a plugin.
    fn remove(&self, plugin_id: &str) -> PluginResult<()>;

    /// Replace the settings, keeping the enabled flag.
    fn set_settings(&self, plugin_id: &str, settings: Map<String, Value>) -> PluginResult<()> {
        let mut entry = self.load(plugin_id)?.unwrap_or_default();
        entry.settings = settings;
        entry.updated_at = Some(Utc::now());
        self.save(plugin_id, &entry)
    }

    /// Record whether the plugin is enabled, keeping the settings.
    fn set_enabled(&self, plugin_id: &str, enabled: bool) -> PluginResult<()> {
        let mut entry = self.load(plugin_id)?.unwrap_or_default();
        entry.enabled = Some(enabled);
        entry.updated_at = Some(Utc::now());
        self.save(plugin_id, &entry)
    }
}

/// Admin store keeping one JSON file per plugin: `<dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct FileAdminStore {
    dir: PathBuf,
}

impl FileAdminStore {
    /// Create a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the entries.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, plugin_id: &str) -> PluginResult<PathBuf> {
        if !is_valid_id(plugin_id) {
            return Err(PluginError::Config(format!("Invalid plugin id '{plugin_id}'")));
        }
        Ok(self.dir.join(format!("{plugin_id}.json")))
    }
}

impl AdminConfigStore for FileAdminStore {
    fn load(&self, plugin_id: &str) -> PluginResult<Option<AdminEntry>> {
        let path = self.path_for(plugin_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| PluginError::Config(format!("{}: {e}", path.display())))
    }

    fn save(&self, plugin_id: &str, entry: &AdminEntry) -> PluginResult<()> {
        let path = self.path_for(plugin_id)?;
        std::fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_string_pretty(entry)
            .map_err(|e| PluginError::Config(e.to_string()))?;

        // Atomic replace.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        std::io::Write::write_all(&mut tmp, content.as_bytes())?;
        tmp.persist(&path).map_err(|e| PluginError::Io(e.error))?;
        Ok(())
    }

    fn remove(&self, plugin_id: &str) -> PluginResult<()> {
        let path = self.path_for(plugin_id)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory admin store.
#[derive(Debug, Default)]
pub struct MemoryAdminStore {
    entries: RwLock<HashMap<String, AdminEntry>>,
}

impl MemoryAdminStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdminConfigStore for MemoryAdminStore {
    fn load(&self, plugin_id: &str) -> PluginResult<Option<AdminEntry>> {
        Ok(self.entries.read().get(plugin_id).cloned())
    }

    fn save(&self, plugin_id: &str, entry: &AdminEntry) -> PluginResult<()> {
        self.entries.write().insert(plugin_id.to_string(), entry.clone());
        Ok(())
    }

    fn remove(&self, plugin_id: &str) -> PluginResult<()> {
        self.entries.write().remove(plugin_id);
        Ok(())
    }
}

/// Where environment overrides are read from.
#[derive(Debug, Clone, Default)]
pub enum EnvSource {
    /// The process environment.
    #[default]
    Process,
    /// A fixed set of variables.
    Fixed(BTreeMap<String, String>),
}

impl EnvSource {
    /// Variables whose name starts with `prefix`, with the prefix stripped.
    fn with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        let strip = |(name, value): (String, String)| {
            name.strip_prefix(prefix)
                .filter(|rest| !rest.is_empty())
                .map(|rest| (rest.to_string(), value))
        };
        match self {
            Self::Process => std::env::vars().filter_map(strip).collect(),
            Self::Fixed(vars) => {
                vars.iter().map(|(k, v)| (k.clone(), v.clone())).filter_map(strip).collect()
            }
        }
    }
}

/// Environment variable prefix for a plugin: `PLUGIN_<ID>_`.
///
/// `-` and `.` fold to `_`, so distinct ids can share or nest prefixes
/// (`open-ai` and `open_ai`, `ds` and `ds-x`). The registry refuses to hold
/// two such ids at once.
pub fn env_prefix(plugin_id: &str) -> String {
    let id: String = plugin_id
        .chars()
        .map(|c| if c == '-' || c == '.' { '_' } else { c.to_ascii_uppercase() })
        .collect();
    format!("PLUGIN_{id}_")
}

#[derive(Default)]
struct Merge {
    settings: Map<String, Value>,
    provenance: BTreeMap<String, ConfigSource>,
}

impl Merge {
    fn fill(&mut self, key: String, value: Value, source: ConfigSource) {
        if !self.settings.contains_key(&key) {
            self.provenance.insert(key.clone(), source);
            self.settings.insert(key, value);
        }
    }
}

/// Merges and validates per-plugin configuration.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    admin: Arc<dyn AdminConfigStore>,
    env: EnvSource,
    file: Arc<BTreeMap<String, Map<String, Value>>>,
    timeout: Duration,
}

impl ConfigResolver {
    /// Create a resolver.
    pub fn new(admin: Arc<dyn AdminConfigStore>, env: EnvSource) -> Self {
        Self { admin, env, file: Arc::new(BTreeMap::new()), timeout: Duration::from_secs(5) }
    }

    /// Set static per-plugin settings from the host configuration file.
    pub fn with_file_settings(mut self, file: BTreeMap<String, Map<String, Value>>) -> Self {
        self.file = Arc::new(file);
        self
    }

    /// Bound on one resolution.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The admin store.
    pub fn admin(&self) -> &Arc<dyn AdminConfigStore> {
        &self.admin
    }

    /// Merge all layers for `plugin_id` and validate against `schema`.
    pub fn resolve(&self, plugin_id: &str, schema: &ConfigSchema) -> PluginResult<ResolvedConfig> {
        let mut merged = Merge::default();

        if let Some(entry) = self.admin.load(plugin_id)? {
            for (key, value) in entry.settings {
                merged.fill(key, value, ConfigSource::Admin);
            }
        }

        for (raw_key, raw) in self.env.with_prefix(&env_prefix(plugin_id)) {
            let key = schema
                .property_name(&raw_key)
                .map_or_else(|| raw_key.to_ascii_lowercase(), str::to_string);
            if merged.settings.contains_key(&key) {
                continue;
            }
            let value = schema.coerce(&key, &raw)?;
            merged.fill(key, value, ConfigSource::Env);
        }

        if let Some(file) = self.file.get(plugin_id) {
            for (key, value) in file {
                merged.fill(key.clone(), value.clone(), ConfigSource::File);
            }
        }

        for (key, value) in schema.defaults() {
            merged.fill(key, value, ConfigSource::Default);
        }

        let Merge { settings, provenance } = merged;
        schema.validate(&settings)?;

        Ok(ResolvedConfig {
            plugin_id: plugin_id.to_string(),
            settings,
            provenance,
            resolved_at: Utc::now(),
        })
    }

    /// Resolve on the blocking pool, bounded by the configured timeout.
    pub async fn resolve_bounded(
        &self,
        plugin_id: &str,
        schema: &ConfigSchema,
    ) -> PluginResult<ResolvedConfig> {
        let resolver = self.clone();
        let id = plugin_id.to_string();
        let schema = schema.clone();
        let task = tokio::task::spawn_blocking(move || resolver.resolve(&id, &schema));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(PluginError::Config(format!("Config resolution failed: {join}"))),
            Err(_) => Err(PluginError::Config(format!(
                "Config resolution for '{plugin_id}' exceeded {:?}",
                self.timeout
            ))),
        }
    }
}
