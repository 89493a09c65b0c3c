//! Turning packages into initialized instances.
//!
//! The loader owns the LOADING → INITIALIZING → READY path and the
//! UNLOADING → UNLOADED path. Every failure after the package identity is
//! verified leaves an ERROR record behind so operators can see it.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::{
    CallContext, ConfigResolver, ManagerOptions, PackageReader, Plugin, PluginError, PluginHost,
    PluginRecord, PluginRegistry, PluginResult, PluginSnapshot, PluginState, ResolvedConfig,
    Transition, ValidatedPackage,
};
use crate::core::{retry_async_if, RetryConfig};

/// Loads and unloads plugins against a registry.
pub struct Loader {
    reader: PackageReader,
    resolver: ConfigResolver,
    host: Arc<dyn PluginHost>,
    registry: Arc<PluginRegistry>,
    options: Arc<ManagerOptions>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("host", &self.host.name())
            .field("plugins", &self.registry.len())
            .finish()
    }
}

impl Loader {
    /// Create a loader.
    pub fn new(
        reader: PackageReader,
        resolver: ConfigResolver,
        host: Arc<dyn PluginHost>,
        registry: Arc<PluginRegistry>,
        options: Arc<ManagerOptions>,
    ) -> Self {
        Self { reader, resolver, host, registry, options }
    }

    pub fn reader(&self) -> &PackageReader {
        &self.reader
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Load the package at `path` up to READY.
    ///
    /// Explicit settings are written to the admin store before config
    /// resolution. Package-level failures leave no record; later failures
    /// leave an ERROR record and are returned.
    pub async fn load(
        &self,
        path: &Path,
        explicit: Option<Map<String, Value>>,
    ) -> PluginResult<PluginSnapshot> {
        let started = Instant::now();
        let package = self.reader.read(path).await?;
        let id = package.id().to_string();

        let _guard = self.registry.lock_transitions(&id).await;
        if self.registry.contains(&id) {
            return Err(PluginError::AlreadyLoaded(id));
        }

        self.registry.insert(PluginRecord::loading(&package))?;
        tracing::debug!(plugin_id = %id, version = %package.version(), "loading plugin");

        let prepared = async {
            if let Some(settings) = explicit {
                self.resolver.admin().set_settings(&id, settings)?;
            }
            self.prepare(&package).await
        };
        let config = match prepared.await {
            Ok(config) => config,
            Err(e) => return Err(self.fail(&id, PluginState::Loading, e)),
        };

        self.registry.compare_and_swap_state(&id, PluginState::Loading, PluginState::Initializing)?;

        let instance = match self.start(&package, &config).await {
            Ok(instance) => instance,
            Err(e) => return Err(self.fail(&id, PluginState::Initializing, e)),
        };

        self.registry.apply(
            &id,
            PluginState::Initializing,
            Transition::to(PluginState::Ready).with_instance(instance).with_config(config),
        )?;

        tracing::info!(
            plugin_id = %id,
            version = %package.version(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "plugin ready"
        );
        self.registry.get(&id)
    }

    fn fail(&self, id: &str, from: PluginState, error: PluginError) -> PluginError {
        tracing::warn!(plugin_id = %id, state = %from, error = %error, "plugin load failed");
        let transition = Transition::to(PluginState::Error).with_error(error.info());
        if let Err(e) = self.registry.apply(id, from, transition) {
            tracing::error!(plugin_id = %id, error = %e, "could not record load failure");
        }
        error
    }

    /// Check dependencies and the host version, then resolve configuration.
    pub async fn prepare(&self, package: &ValidatedPackage) -> PluginResult<ResolvedConfig> {
        let manifest = package.manifest();
        manifest.check_host_version(&self.options.host_version)?;
        self.check_dependencies(package)?;
        self.resolver.resolve_bounded(&manifest.id, &manifest.config_schema).await
    }

    fn check_dependencies(&self, package: &ValidatedPackage) -> PluginResult<()> {
        let id = package.id();
        for (dep, requirement) in package.manifest().dependency_requirements()? {
            let (state, version) = self
                .registry
                .with_record(&dep, |r| (r.state(), r.version().to_string()))
                .map_err(|_| PluginError::dependency(id, format!("'{dep}' is not loaded")))?;

            if !state.has_instance() {
                return Err(PluginError::dependency(id, format!("'{dep}' is {state}")));
            }

            let version = semver::Version::parse(&version).map_err(|e| {
                PluginError::dependency(id, format!("'{dep}' has unparseable version: {e}"))
            })?;
            if !requirement.matches(&version) {
                return Err(PluginError::dependency(
                    id,
                    format!("'{dep}' {version} does not satisfy {requirement}"),
                ));
            }
        }
        Ok(())
    }

    /// Create and initialize an instance, retrying init timeouts on fresh
    /// instances.
    pub async fn start(
        &self,
        package: &ValidatedPackage,
        config: &ResolvedConfig,
    ) -> PluginResult<Arc<dyn Plugin>> {
        let retry = RetryConfig::with_attempts(self.options.init_retries);
        let outcome = retry_async_if(
            &retry,
            move |attempt| self.start_once(package, config, attempt),
            |e| matches!(e, PluginError::InitTimeout(..)),
        )
        .await;

        if outcome.was_retried() {
            tracing::info!(
                plugin_id = %package.id(),
                attempts = outcome.attempts,
                ok = outcome.is_ok(),
                "init retried"
            );
        }
        outcome.into_result()
    }

    async fn start_once(
        &self,
        package: &ValidatedPackage,
        config: &ResolvedConfig,
        attempt: u32,
    ) -> PluginResult<Arc<dyn Plugin>> {
        let id = package.id();
        let instance: Arc<dyn Plugin> = Arc::from(self.host.instantiate(package).await?);

        let reported = instance.metadata().id;
        if reported != id {
            return Err(PluginError::InitFailure {
                plugin: id.to_string(),
                message: format!("instance reports id '{reported}'"),
            });
        }

        instance.validate_config(config)?;

        let timeout = self.options.init_timeout;
        let ctx = CallContext::new(timeout, CancellationToken::new());
        tracing::debug!(plugin_id = %id, attempt, "initializing");

        match tokio::time::timeout(timeout, instance.initialize(config, &ctx)).await {
            Err(_) => {
                ctx.token().cancel();
                Err(PluginError::InitTimeout(id.to_string(), timeout))
            }
            Ok(Err(e @ (PluginError::Validation { .. } | PluginError::InitFailure { .. }))) => Err(e),
            Ok(Err(e)) => {
                Err(PluginError::InitFailure { plugin: id.to_string(), message: e.to_string() })
            }
            Ok(Ok(())) if !instance.ready() => Err(PluginError::InitFailure {
                plugin: id.to_string(),
                message: "not ready after initialize".to_string(),
            }),
            Ok(Ok(())) => Ok(instance),
        }
    }

    /// Unload `id`: UNLOADING, bounded cleanup, record removed.
    pub async fn unload(&self, id: &str) -> PluginResult<PluginSnapshot> {
        let _guard = self.registry.lock_transitions(id).await;
        self.unload_locked(id).await
    }

    /// [`unload`](Self::unload) for callers already holding the transition
    /// lock. ACTIVE records should be drained first.
    pub(crate) async fn unload_locked(&self, id: &str) -> PluginResult<PluginSnapshot> {
        let state = self.registry.state(id)?;
        let detached = self.registry.apply(id, state, Transition::to(PluginState::Unloading))?;

        if let Some(instance) = detached {
            cleanup(id, instance.as_ref(), self.options.cleanup_timeout).await;
        }

        let snapshot = self.registry.remove(id).ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        tracing::info!(plugin_id = %id, version = %snapshot.version, "plugin unloaded");
        Ok(snapshot)
    }
}

/// Run `cleanup` once, bounded by `timeout`. Failures are logged.
pub(crate) async fn cleanup(id: &str, instance: &dyn Plugin, timeout: std::time::Duration) {
    let ctx = CallContext::new(timeout, CancellationToken::new());
    match tokio::time::timeout(timeout, instance.cleanup(&ctx)).await {
        Ok(Ok(())) => tracing::debug!(plugin_id = %id, "cleanup finished"),
        Ok(Err(e)) => tracing::warn!(plugin_id = %id, error = %e, "cleanup failed"),
        Err(_) => {
            ctx.token().cancel();
            tracing::warn!(plugin_id = %id, timeout_ms = timeout.as_millis() as u64, "cleanup timed out");
        }
    }
}
