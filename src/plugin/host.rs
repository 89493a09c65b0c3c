//! Host (sandbox) contract: turning a validated package into an instance.
//!
//! A host owns everything about *how* plugin code runs. The runtime only
//! relies on the [`Plugin`] contract of what comes back.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    EntrypointKind, Plugin, PluginError, PluginManifest, PluginResult, ProcessHost,
    ValidatedPackage,
};

/// Creates plugin instances from validated packages.
#[async_trait]
pub trait PluginHost: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Create a fresh, uninitialized instance.
    ///
    /// Called once per load attempt; instances are never reused across
    /// loads.
    async fn instantiate(&self, package: &ValidatedPackage) -> PluginResult<Box<dyn Plugin>>;
}

/// Constructor for a builtin plugin: gets the manifest and the extracted
/// payload directory.
pub type PluginFactory =
    Arc<dyn Fn(&PluginManifest, &Path) -> PluginResult<Box<dyn Plugin>> + Send + Sync>;

/// In-process host with factories registered by entrypoint name.
#[derive(Default)]
pub struct BuiltinHost {
    factories: RwLock<HashMap<String, PluginFactory>>,
}

impl std::fmt::Debug for BuiltinHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.factories.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("BuiltinHost").field("entrypoints", &names).finish()
    }
}

impl BuiltinHost {
    /// Create a host with no entrypoints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `entrypoint`, replacing any previous one.
    pub fn register<F>(&self, entrypoint: impl Into<String>, factory: F)
    where
        F: Fn(&PluginManifest, &Path) -> PluginResult<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.factories.write().insert(entrypoint.into(), Arc::new(factory));
    }

    /// Check if an entrypoint is registered.
    pub fn contains(&self, entrypoint: &str) -> bool {
        self.factories.read().contains_key(entrypoint)
    }

    /// Registered entrypoint names, sorted.
    pub fn entrypoints(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl PluginHost for BuiltinHost {
    fn name(&self) -> &'static str {
        "builtin"
    }

    async fn instantiate(&self, package: &ValidatedPackage) -> PluginResult<Box<dyn Plugin>> {
        let manifest = package.manifest();
        let target = manifest.entrypoint_target();
        let factory = self.factories.read().get(&target).cloned().ok_or_else(|| {
            PluginError::InitFailure {
                plugin: manifest.id.clone(),
                message: format!("no builtin entrypoint '{target}'"),
            }
        })?;
        factory(manifest, package.scratch_path())
    }
}

/// Routes each package to the host matching its entrypoint kind.
#[derive(Debug, Clone)]
pub struct HostRouter {
    builtin: Arc<BuiltinHost>,
    process: Arc<ProcessHost>,
}

impl HostRouter {
    /// Create a router over the two hosts.
    pub fn new(builtin: Arc<BuiltinHost>, process: Arc<ProcessHost>) -> Self {
        Self { builtin, process }
    }

    /// The in-process host, for registering factories.
    pub fn builtin(&self) -> &Arc<BuiltinHost> {
        &self.builtin
    }

    /// The out-of-process host.
    pub fn process(&self) -> &Arc<ProcessHost> {
        &self.process
    }

    fn host_for(&self, kind: EntrypointKind) -> &dyn PluginHost {
        match kind {
            EntrypointKind::Builtin => self.builtin.as_ref(),
            EntrypointKind::Process => self.process.as_ref(),
        }
    }
}

impl Default for HostRouter {
    fn default() -> Self {
        Self::new(Arc::new(BuiltinHost::new()), Arc::new(ProcessHost::new()))
    }
}

#[async_trait]
impl PluginHost for HostRouter {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn instantiate(&self, package: &ValidatedPackage) -> PluginResult<Box<dyn Plugin>> {
        let host = self.host_for(package.manifest().entrypoint.kind);
        tracing::debug!(plugin_id = %package.id(), host = host.name(), "instantiating plugin");
        host.instantiate(package).await
    }
}
