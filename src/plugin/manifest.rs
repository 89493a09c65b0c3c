//! Plugin manifest parsing and validation.
//!
//! Every package carries a `manifest.json` describing the plugin's identity,
//! capabilities, dependencies, configuration schema and integrity data.

use std::collections::BTreeMap;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use super::{Capability, ConfigSchema, PluginError, PluginInfo, PluginResult, PROCESS_BINARY};

/// Plugin manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Plugin version (semver).
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    /// Declared capabilities.
    pub capabilities: Vec<CapabilityDecl>,
    /// Provider identifier (e.g. `dashscope`, `openai`).
    #[serde(default)]
    pub provider: String,
    /// Plugin id to semver range.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// Lowest host version this plugin runs on.
    #[serde(default, alias = "min_version", skip_serializing_if = "Option::is_none")]
    pub min_host_version: Option<String>,
    /// Highest host version this plugin runs on.
    #[serde(default, alias = "max_version", skip_serializing_if = "Option::is_none")]
    pub max_host_version: Option<String>,
    #[serde(default)]
    pub config_schema: ConfigSchema,
    /// How the host instantiates the plugin.
    #[serde(default)]
    pub entrypoint: Entrypoint,
    /// Whether concurrent capability calls are allowed.
    #[serde(default = "default_reentrant")]
    pub reentrant: bool,
    /// Base64 ed25519 signature.
    #[serde(default)]
    pub signature: String,
    /// Hex SHA-256 of the payload.
    #[serde(default)]
    pub checksum: String,
}

fn default_reentrant() -> bool {
    true
}

/// A declared capability and the models it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDecl {
    #[serde(rename = "type")]
    pub capability: Capability,
    #[serde(default)]
    pub models: Vec<String>,
}

impl CapabilityDecl {
    /// Create a declaration.
    pub fn new(capability: Capability, models: &[&str]) -> Self {
        Self { capability, models: models.iter().map(|m| (*m).to_string()).collect() }
    }
}

/// Kind of entrypoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrypointKind {
    /// An in-process factory registered with the host.
    #[default]
    Builtin,
    /// An executable in the payload speaking JSON-RPC over stdio.
    Process,
}

/// Where the plugin implementation lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entrypoint {
    #[serde(default)]
    pub kind: EntrypointKind,
    /// Factory name or payload path; defaults depend on `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl PluginManifest {
    /// Parse a manifest from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> PluginResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| PluginError::InvalidManifest(e.to_string()))
    }

    /// Serialize to pretty JSON.
    pub fn to_json_pretty(&self) -> PluginResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| PluginError::InvalidManifest(e.to_string()))
    }

    /// Canonical bytes covered by the signature: compact JSON with an empty signature.
    pub fn canonical_bytes(&self) -> PluginResult<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        serde_json::to_vec(&unsigned).map_err(|e| PluginError::InvalidManifest(e.to_string()))
    }

    /// Validate the manifest.
    pub fn validate(&self) -> PluginResult<()> {
        if self.id.is_empty() {
            return Err(PluginError::InvalidManifest("Plugin id is required".to_string()));
        }

        if !is_valid_id(&self.id) {
            return Err(PluginError::InvalidManifest(
                "Plugin id must contain only ASCII alphanumeric characters, hyphens, and underscores"
                    .to_string(),
            ));
        }

        if self.name.trim().is_empty() {
            return Err(PluginError::InvalidManifest("Plugin name is required".to_string()));
        }

        self.parsed_version()?;

        if self.capabilities.is_empty() {
            return Err(PluginError::InvalidManifest(
                "At least one capability must be declared".to_string(),
            ));
        }

        for (dep, range) in &self.dependencies {
            if !is_valid_id(dep) {
                return Err(PluginError::InvalidManifest(format!("Invalid dependency id '{dep}'")));
            }
            if dep == &self.id {
                return Err(PluginError::InvalidManifest("Plugin cannot depend on itself".into()));
            }
            VersionReq::parse(range).map_err(|e| {
                PluginError::InvalidManifest(format!("Invalid version range for '{dep}': {e}"))
            })?;
        }

        for bound in [&self.min_host_version, &self.max_host_version].into_iter().flatten() {
            Version::parse(bound).map_err(|e| {
                PluginError::InvalidManifest(format!("Invalid host version bound '{bound}': {e}"))
            })?;
        }

        if !self.checksum.is_empty()
            && (self.checksum.len() % 2 != 0 || !self.checksum.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(PluginError::InvalidManifest("Checksum must be hex".to_string()));
        }

        self.config_schema.check_consistency()
    }

    /// Parsed semantic version.
    pub fn parsed_version(&self) -> PluginResult<Version> {
        Version::parse(&self.version).map_err(|e| {
            PluginError::InvalidManifest(format!("Version '{}' is not semver: {e}", self.version))
        })
    }

    /// Check the host version against the manifest bounds.
    pub fn check_host_version(&self, host: &Version) -> PluginResult<()> {
        if let Some(min) = &self.min_host_version {
            let min = Version::parse(min).map_err(|e| PluginError::InvalidManifest(e.to_string()))?;
            if host < &min {
                return Err(PluginError::dependency(
                    &self.id,
                    format!("requires host >= {min}, running {host}"),
                ));
            }
        }
        if let Some(max) = &self.max_host_version {
            let max = Version::parse(max).map_err(|e| PluginError::InvalidManifest(e.to_string()))?;
            if host > &max {
                return Err(PluginError::dependency(
                    &self.id,
                    format!("requires host <= {max}, running {host}"),
                ));
            }
        }
        Ok(())
    }

    /// Declared dependencies with parsed ranges.
    pub fn dependency_requirements(&self) -> PluginResult<Vec<(String, VersionReq)>> {
        self.dependencies
            .iter()
            .map(|(id, range)| {
                VersionReq::parse(range)
                    .map(|req| (id.clone(), req))
                    .map_err(|e| PluginError::InvalidManifest(e.to_string()))
            })
            .collect()
    }

    /// Declared capability tags.
    pub fn capability_tags(&self) -> Vec<Capability> {
        let mut tags: Vec<Capability> = self.capabilities.iter().map(|c| c.capability).collect();
        tags.sort();
        tags.dedup();
        tags
    }

    /// Check if the manifest declares a capability.
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.iter().any(|c| c.capability == capability)
    }

    /// Models declared for a capability.
    pub fn models_for(&self, capability: Capability) -> Vec<&str> {
        self.capabilities
            .iter()
            .filter(|c| c.capability == capability)
            .flat_map(|c| c.models.iter().map(String::as_str))
            .collect()
    }

    /// Check if the plugin serves `model` for `capability`.
    ///
    /// A capability declared without models serves any model.
    pub fn supports_model(&self, capability: Capability, model: &str) -> bool {
        self.capabilities.iter().any(|c| {
            c.capability == capability && (c.models.is_empty() || c.models.iter().any(|m| m == model))
        })
    }

    /// Resolved entrypoint target.
    pub fn entrypoint_target(&self) -> String {
        match (&self.entrypoint.target, self.entrypoint.kind) {
            (Some(target), _) => target.clone(),
            (None, EntrypointKind::Builtin) => self.id.clone(),
            (None, EntrypointKind::Process) => PROCESS_BINARY.to_string(),
        }
    }

    /// Identity as reported to callers.
    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            provider: (!self.provider.is_empty()).then(|| self.provider.clone()),
            capabilities: self.capability_tags(),
        }
    }
}

/// Check a plugin id: `[A-Za-z0-9_-]+`.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
