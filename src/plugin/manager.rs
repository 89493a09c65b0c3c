//! Plugin manager: discovery, lifecycle operations and dispatch.
//!
//! The manager is the only component that moves records between states.
//! Every lifecycle operation on an id runs under that id's transition lock;
//! dispatch never takes it and never changes state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use walkdir::WalkDir;

use super::loader::cleanup;
use super::{
    chat_channel, CallContext, Capability, CapabilityRequest, CapabilityResponse, ChatRequest,
    ChatStream, ConfigResolver, DispatchTarget, ErrorInfo, Loader, PackageReader, Plugin,
    PluginError, PluginHost, PluginRecord, PluginRegistry, PluginResult, PluginSnapshot,
    PluginState, DEFAULT_STREAM_BUFFER, PACKAGE_EXTENSION,
};
use crate::core::{ConfigError, HostConfig};

/// How `upgrade` hands over from the running version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradePolicy {
    /// Drain the old version, then swap in the new one.
    #[default]
    DrainThenSwap,
    /// Swap first; in-flight calls on the old version finish within the
    /// drain grace period.
    HotSwap,
}

/// Manager settings.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Version checked against manifest host-version bounds.
    pub host_version: Version,
    /// Default directory for `discover`.
    pub plugins_dir: PathBuf,
    /// Enable plugins as soon as they are READY.
    pub auto_enable: bool,
    /// Extra init attempts after an init timeout.
    pub init_retries: u32,
    pub upgrade_policy: UpgradePolicy,
    pub init_timeout: Duration,
    pub cleanup_timeout: Duration,
    pub call_timeout: Duration,
    /// Grace period for in-flight calls when disabling, unloading or upgrading.
    pub drain_grace: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            host_version: Version::new(0, 1, 0),
            plugins_dir: PathBuf::from("plugins"),
            auto_enable: false,
            init_retries: 1,
            upgrade_policy: UpgradePolicy::default(),
            init_timeout: Duration::from_secs(30),
            cleanup_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
            drain_grace: Duration::from_secs(5),
        }
    }
}

/// A package that failed during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryFailure {
    pub path: PathBuf,
    pub error: ErrorInfo,
}

/// Outcome of one `discover` pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    /// Ids loaded by this pass.
    pub loaded: Vec<String>,
    /// Ids that already had a record.
    pub skipped: Vec<String>,
    pub failed: Vec<DiscoveryFailure>,
}

/// Owns the registry and drives every plugin through its lifecycle.
#[derive(Debug)]
pub struct PluginManager {
    loader: Loader,
    registry: Arc<PluginRegistry>,
    options: Arc<ManagerOptions>,
}

impl PluginManager {
    /// Create a manager with an empty registry.
    pub fn new(
        options: ManagerOptions,
        reader: PackageReader,
        resolver: ConfigResolver,
        host: Arc<dyn PluginHost>,
    ) -> Self {
        let registry = Arc::new(PluginRegistry::new());
        let options = Arc::new(options);
        let loader =
            Loader::new(reader, resolver, host, Arc::clone(&registry), Arc::clone(&options));
        Self { loader, registry, options }
    }

    /// Build a manager from host configuration, reading the process
    /// environment for plugin settings.
    pub fn from_config(config: &HostConfig, host: Arc<dyn PluginHost>) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.manager_options()?,
            PackageReader::new(config.reader_options()?),
            config.resolver(super::EnvSource::Process)?,
            host,
        ))
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    // ========================================================================
    // Discovery and loading
    // ========================================================================

    /// Load every `*.xpkg` under `dir` (the configured plugins directory when
    /// `None`). Packages load concurrently; one failure never stops the rest.
    pub async fn discover(&self, dir: Option<&Path>) -> PluginResult<DiscoveryReport> {
        let dir = dir.unwrap_or(&self.options.plugins_dir);
        if !dir.is_dir() {
            return Err(PluginError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("plugin directory {} does not exist", dir.display()),
            )));
        }

        let mut packages: Vec<PathBuf> = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .filter(|p| p.extension().is_some_and(|ext| ext == PACKAGE_EXTENSION))
            .collect();
        packages.sort();

        tracing::info!(dir = %dir.display(), packages = packages.len(), "discovering plugins");

        let outcomes = join_all(packages.iter().map(|path| self.load(path, None))).await;

        let mut report = DiscoveryReport::default();
        for (path, outcome) in packages.into_iter().zip(outcomes) {
            match outcome {
                Ok(snapshot) => report.loaded.push(snapshot.id),
                Err(PluginError::AlreadyLoaded(id)) => report.skipped.push(id),
                Err(e) => report.failed.push(DiscoveryFailure { path, error: e.info() }),
            }
        }

        tracing::info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "discovery finished"
        );
        Ok(report)
    }

    /// Load one package, writing `explicit` settings to the admin store
    /// first. The plugin is enabled afterwards when auto-enable is on or its
    /// admin entry says so.
    pub async fn load(
        &self,
        path: &Path,
        explicit: Option<Map<String, Value>>,
    ) -> PluginResult<PluginSnapshot> {
        let snapshot = self.loader.load(path, explicit).await?;

        if self.should_enable(&snapshot.id) {
            match self.enable(&snapshot.id).await {
                Ok(enabled) => return Ok(enabled),
                Err(e) => tracing::warn!(plugin_id = %snapshot.id, error = %e, "auto-enable failed"),
            }
        }
        Ok(snapshot)
    }

    fn should_enable(&self, id: &str) -> bool {
        if self.options.auto_enable {
            return true;
        }
        match self.loader.resolver().admin().load(id) {
            Ok(entry) => entry.and_then(|e| e.enabled).unwrap_or(false),
            Err(e) => {
                tracing::warn!(plugin_id = %id, error = %e, "could not read admin entry");
                false
            }
        }
    }

    fn persist_enabled(&self, id: &str, enabled: bool) {
        if let Err(e) = self.loader.resolver().admin().set_enabled(id, enabled) {
            tracing::warn!(plugin_id = %id, error = %e, "could not persist enabled flag");
        }
    }

    fn invalid(id: &str, from: PluginState, requested: &str) -> PluginError {
        PluginError::InvalidTransition { plugin: id.to_string(), from, requested: requested.to_string() }
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// READY or DISABLED → ACTIVE.
    pub async fn enable(&self, id: &str) -> PluginResult<PluginSnapshot> {
        let _guard = self.registry.lock_transitions(id).await;
        let state = self.registry.state(id)?;
        if !matches!(state, PluginState::Ready | PluginState::Disabled) {
            return Err(Self::invalid(id, state, "enable"));
        }

        self.registry.compare_and_swap_state(id, state, PluginState::Active)?;
        self.registry.with_record(id, |r| r.gate().reopen())?;
        self.persist_enabled(id, true);

        tracing::info!(plugin_id = %id, "plugin enabled");
        self.registry.get(id)
    }

    /// ACTIVE → DISABLED. In-flight calls get the drain grace period, then
    /// are cancelled; the transition completes either way.
    pub async fn disable(&self, id: &str) -> PluginResult<PluginSnapshot> {
        let _guard = self.registry.lock_transitions(id).await;
        let state = self.registry.state(id)?;
        if state != PluginState::Active {
            return Err(Self::invalid(id, state, "disable"));
        }

        self.drain(id).await?;
        self.registry.compare_and_swap_state(id, PluginState::Active, PluginState::Disabled)?;
        self.persist_enabled(id, false);

        tracing::info!(plugin_id = %id, "plugin disabled");
        self.registry.get(id)
    }

    async fn drain(&self, id: &str) -> PluginResult<()> {
        let gate = self.registry.with_record(id, |r| Arc::clone(r.gate()))?;
        let outcome = gate.drain(self.options.drain_grace).await;
        if outcome.completed() {
            tracing::debug!(plugin_id = %id, elapsed_ms = outcome.waited.as_millis() as u64, "drained");
        } else {
            tracing::warn!(
                plugin_id = %id,
                cancelled = outcome.cancelled,
                elapsed_ms = outcome.waited.as_millis() as u64,
                "drain grace expired, cancelled in-flight calls"
            );
        }
        Ok(())
    }

    /// Remove a plugin: drain if ACTIVE, clean up once, drop the record.
    pub async fn unload(&self, id: &str) -> PluginResult<PluginSnapshot> {
        let _guard = self.registry.lock_transitions(id).await;
        if self.registry.state(id)? == PluginState::Active {
            self.drain(id).await?;
        }
        self.loader.unload_locked(id).await
    }

    /// Re-resolve configuration and hand it to the running instance.
    ///
    /// `settings`, when given, replace the admin settings first. On failure
    /// the record keeps its previous config and the admin entry is restored.
    pub async fn reload_config(
        &self,
        id: &str,
        settings: Option<Map<String, Value>>,
    ) -> PluginResult<PluginSnapshot> {
        let _guard = self.registry.lock_transitions(id).await;
        let (state, manifest, instance) = self.registry.with_record(id, |r| {
            (r.state(), Arc::clone(r.manifest()), r.instance().cloned())
        })?;
        let Some(instance) = instance.filter(|_| state.has_instance()) else {
            return Err(Self::invalid(id, state, "reload config of"));
        };

        let admin = self.loader.resolver().admin();
        let previous = match &settings {
            Some(_) => Some(admin.load(id)?),
            None => None,
        };
        if let Some(settings) = settings {
            admin.set_settings(id, settings)?;
        }

        let outcome = self.apply_config(id, &manifest.config_schema, instance.as_ref()).await;

        match outcome {
            Ok(config) => {
                self.registry.set_config(id, config)?;
                tracing::info!(plugin_id = %id, "config reloaded");
                self.registry.get(id)
            }
            Err(e) => {
                let restored = match previous {
                    Some(Some(entry)) => admin.save(id, &entry),
                    Some(None) => admin.remove(id),
                    None => Ok(()),
                };
                if let Err(restore) = restored {
                    tracing::warn!(plugin_id = %id, error = %restore, "could not restore admin entry");
                }
                tracing::warn!(plugin_id = %id, error = %e, "config reload failed");
                Err(e)
            }
        }
    }

    async fn apply_config(
        &self,
        id: &str,
        schema: &super::ConfigSchema,
        instance: &dyn Plugin,
    ) -> PluginResult<super::ResolvedConfig> {
        let config = self.loader.resolver().resolve_bounded(id, schema).await?;
        instance.validate_config(&config)?;

        let timeout = self.options.init_timeout;
        let ctx = CallContext::new(timeout, tokio_util::sync::CancellationToken::new());
        match tokio::time::timeout(timeout, instance.reload_config(&config, &ctx)).await {
            Ok(result) => result.map(|()| config),
            Err(_) => {
                ctx.token().cancel();
                Err(PluginError::InitTimeout(id.to_string(), timeout))
            }
        }
    }

    /// Replace a running plugin with the package at `path`.
    ///
    /// The new version is verified, configured and initialized outside the
    /// registry; only then is it swapped in, keeping the old record's
    /// READY/ACTIVE/DISABLED state. Any failure before the swap leaves the
    /// old version serving.
    pub async fn upgrade(&self, id: &str, path: &Path) -> PluginResult<PluginSnapshot> {
        let _guard = self.registry.lock_transitions(id).await;
        let (state, old_version) =
            self.registry.with_record(id, |r| (r.state(), r.version().to_string()))?;
        if !state.has_instance() {
            return Err(Self::invalid(id, state, "upgrade"));
        }

        let package = self.loader.reader().read(path).await?;
        if package.id() != id {
            return Err(PluginError::InvalidManifest(format!(
                "package id '{}' does not match '{id}'",
                package.id()
            )));
        }

        let config = self.loader.prepare(&package).await?;
        let instance = self.loader.start(&package, &config).await?;

        let mut record = PluginRecord::loading(&package);
        if !instance.reentrant() {
            record.gate.set_serialized(true);
        }
        record.instance = Some(instance);
        record.config = Some(config);
        record.state = state;

        let (old_gate, old_instance, old_scratch) = self.registry.with_record(id, |r| {
            (Arc::clone(r.gate()), r.instance().cloned(), r.scratch.clone())
        })?;

        match self.options.upgrade_policy {
            UpgradePolicy::DrainThenSwap => {
                if state == PluginState::Active {
                    self.drain(id).await?;
                }
                self.registry.upsert(record);
            }
            UpgradePolicy::HotSwap => {
                self.registry.upsert(record);
                let outcome = old_gate.drain(self.options.drain_grace).await;
                if !outcome.completed() {
                    tracing::warn!(
                        plugin_id = %id,
                        cancelled = outcome.cancelled,
                        "old version calls cancelled"
                    );
                }
            }
        }

        if let Some(old) = old_instance {
            cleanup(id, old.as_ref(), self.options.cleanup_timeout).await;
        }
        drop(old_scratch);

        tracing::info!(
            plugin_id = %id,
            from = %old_version,
            to = %package.version(),
            policy = ?self.options.upgrade_policy,
            "plugin upgraded"
        );
        self.registry.get(id)
    }

    /// Unload every plugin.
    pub async fn shutdown(&self) {
        let ids = self.registry.ids();
        tracing::info!(plugins = ids.len(), "shutting down plugin manager");
        let outcomes = join_all(ids.iter().map(|id| self.unload(id))).await;
        for (id, outcome) in ids.iter().zip(outcomes) {
            if let Err(e) = outcome {
                tracing::warn!(plugin_id = %id, error = %e, "unload during shutdown failed");
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get(&self, id: &str) -> PluginResult<PluginSnapshot> {
        self.registry.get(id)
    }

    pub fn list(&self) -> Vec<PluginSnapshot> {
        self.registry.list()
    }

    /// ACTIVE plugins providing `capability`, in registration order.
    pub fn list_by_capability(&self, capability: Capability) -> Vec<PluginSnapshot> {
        self.registry.list_by_capability(capability)
    }

    /// Plugins shipped by `provider`, whatever their state.
    pub fn list_by_provider(&self, provider: &str) -> Vec<PluginSnapshot> {
        self.registry.list_by_provider(provider)
    }

    /// First ACTIVE provider of `capability`, optionally serving `model`.
    pub fn find_provider(&self, capability: Capability, model: Option<&str>) -> PluginResult<PluginSnapshot> {
        self.registry
            .list_by_capability(capability)
            .into_iter()
            .find(|s| match model {
                None => true,
                Some(model) => self
                    .registry
                    .with_record(&s.id, |r| r.manifest().supports_model(capability, model))
                    .unwrap_or(false),
            })
            .ok_or_else(|| {
                PluginError::NotFound(match model {
                    Some(model) => format!("{capability} provider for model '{model}'"),
                    None => format!("{capability} provider"),
                })
            })
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Dispatch an opaque payload to `capability` on an ACTIVE plugin.
    pub async fn dispatch(&self, id: &str, capability: Capability, payload: Value) -> PluginResult<Value> {
        let request = match CapabilityRequest::from_payload(capability, payload) {
            Ok(request) => request,
            Err(PluginError::Unsupported { capability, .. }) => {
                let plugin = id.to_string();
                return self.rejected(id, PluginError::Unsupported { plugin, capability });
            }
            Err(e) => return self.rejected(id, e),
        };
        self.call(id, request).await?.to_payload()
    }

    fn target(&self, id: &str, capability: Capability) -> PluginResult<DispatchTarget> {
        let target = self.registry.dispatch_target(id)?;
        if !target.instance.provides(capability) {
            return Err(PluginError::Unsupported {
                plugin: id.to_string(),
                capability: capability.to_string(),
            });
        }
        Ok(target)
    }

    /// Make a typed capability call on an ACTIVE plugin.
    ///
    /// Bounded by the call timeout and cancelled if the plugin is drained.
    /// Records stats; never changes lifecycle state.
    pub async fn call(&self, id: &str, request: CapabilityRequest) -> PluginResult<CapabilityResponse> {
        let target = match self.target(id, request.capability()) {
            Ok(target) => target,
            Err(e) => return self.rejected(id, e),
        };
        let Some(permit) = target.gate.enter() else {
            return self.rejected(id, self.draining(id));
        };
        let token = permit.token().clone();
        let timeout = self.options.call_timeout;
        let started = Instant::now();

        let call = async {
            let _serial = target.gate.serialize().await;
            let ctx = CallContext::new(timeout, token.clone());
            invoke(id, &target, request, &ctx).await
        };

        let result = tokio::select! {
            r = tokio::time::timeout(timeout, call) => {
                r.unwrap_or_else(|_| Err(PluginError::CallTimeout(id.to_string(), timeout)))
            }
            () = token.cancelled() => Err(PluginError::Cancelled(id.to_string())),
        };
        drop(permit);

        let elapsed = started.elapsed();
        self.registry.update_stats(id, |s| s.record(elapsed, &result));
        let elapsed_ms = elapsed.as_millis() as u64;
        match &result {
            Ok(_) => tracing::debug!(plugin_id = %id, elapsed_ms, "call finished"),
            Err(e) => tracing::warn!(plugin_id = %id, error = %e, elapsed_ms, "call failed"),
        }
        result
    }

    /// Count a call turned away before it reached the plugin.
    fn rejected<T>(&self, id: &str, error: PluginError) -> PluginResult<T> {
        let outcome = Err(error);
        self.registry.update_stats(id, |s| s.record(Duration::ZERO, &outcome));
        if let Err(e) = &outcome {
            tracing::debug!(plugin_id = %id, error = %e, "call rejected");
        }
        outcome
    }

    fn draining(&self, id: &str) -> PluginError {
        let state = self.registry.state(id).unwrap_or(PluginState::Active);
        PluginError::NotReady { plugin: id.to_string(), state }
    }

    /// Stream a chat completion from an ACTIVE plugin.
    ///
    /// Errors known up front are returned directly; anything later arrives
    /// as the stream's terminal `Error` event.
    pub async fn dispatch_stream(&self, id: &str, request: ChatRequest) -> PluginResult<ChatStream> {
        let target = match self.target(id, Capability::Chat) {
            Ok(target) => target,
            Err(e) => return self.rejected(id, e),
        };
        if let Err(e) = check_model(id, &target, &request) {
            return self.rejected(id, e);
        }
        let Some(permit) = target.gate.enter() else {
            return self.rejected(id, self.draining(id));
        };

        let (sink, stream) = chat_channel(DEFAULT_STREAM_BUFFER);
        let registry = Arc::clone(&self.registry);
        let timeout = self.options.call_timeout;
        let id = id.to_string();

        tokio::spawn(async move {
            let token = permit.token().clone();
            let started = Instant::now();

            let call = async {
                let _serial = target.gate.serialize().await;
                let ctx = CallContext::new(timeout, token.clone());
                match target.instance.as_chat() {
                    Some(chat) => chat.chat_stream(&request, &sink, &ctx).await,
                    None => Err(PluginError::Unsupported {
                        plugin: id.clone(),
                        capability: Capability::Chat.to_string(),
                    }),
                }
            };

            let result = tokio::select! {
                r = tokio::time::timeout(timeout, call) => {
                    r.unwrap_or_else(|_| Err(PluginError::CallTimeout(id.clone(), timeout)))
                }
                () = token.cancelled() => Err(PluginError::Cancelled(id.clone())),
            };
            drop(permit);

            registry.update_stats(&id, |s| s.record(started.elapsed(), &result));
            if let Err(e) = &result {
                tracing::warn!(plugin_id = %id, error = %e, "chat stream failed");
            }
            sink.finish(result.map_err(|e| e.info())).await;
        });

        Ok(stream)
    }
}

fn check_model(id: &str, target: &DispatchTarget, request: &ChatRequest) -> PluginResult<()> {
    if request.model.is_empty() || target.manifest.supports_model(Capability::Chat, &request.model) {
        return Ok(());
    }
    Err(PluginError::validation("model", format!("plugin '{id}' does not serve model '{}'", request.model)))
}

async fn invoke(
    id: &str,
    target: &DispatchTarget,
    request: CapabilityRequest,
    ctx: &CallContext,
) -> PluginResult<CapabilityResponse> {
    let instance = target.instance.as_ref();
    let unsupported = |capability: Capability| PluginError::Unsupported {
        plugin: id.to_string(),
        capability: capability.to_string(),
    };

    match request {
        CapabilityRequest::Embed { text } => {
            let embedder = instance.as_embedder().ok_or_else(|| unsupported(Capability::Embedding))?;
            let vector = embedder.embed(&text, ctx).await?;
            let dimensions = embedder.dimensions();
            check_dimensions(id, vector.len(), dimensions)?;
            Ok(CapabilityResponse::Embedding { vector, dimensions })
        }
        CapabilityRequest::EmbedBatch { texts } => {
            let embedder = instance.as_embedder().ok_or_else(|| unsupported(Capability::Embedding))?;
            let vectors = embedder.embed_batch(&texts, ctx).await?;
            if vectors.len() != texts.len() {
                return Err(PluginError::RuntimeFailure(format!(
                    "plugin '{id}' returned {} vectors for {} texts",
                    vectors.len(),
                    texts.len()
                )));
            }
            let dimensions = embedder.dimensions();
            for vector in &vectors {
                check_dimensions(id, vector.len(), dimensions)?;
            }
            Ok(CapabilityResponse::Embeddings { vectors, dimensions })
        }
        CapabilityRequest::Rerank { query, documents } => {
            let reranker = instance.as_reranker().ok_or_else(|| unsupported(Capability::Rerank))?;
            let mut results = reranker.rerank(&query, &documents, ctx).await?;
            results.sort_by(|a, b| b.score.total_cmp(&a.score));
            for (rank, result) in results.iter_mut().enumerate() {
                result.rank = rank;
            }
            Ok(CapabilityResponse::Rerank { results })
        }
        CapabilityRequest::Chat(request) => {
            check_model(id, target, &request)?;
            let chat = instance.as_chat().ok_or_else(|| unsupported(Capability::Chat))?;
            Ok(CapabilityResponse::Chat(chat.chat(&request, ctx).await?))
        }
    }
}

fn check_dimensions(id: &str, actual: usize, declared: usize) -> PluginResult<()> {
    if actual == declared {
        Ok(())
    } else {
        Err(PluginError::RuntimeFailure(format!(
            "plugin '{id}' returned a {actual}-dimensional vector, declared {declared}"
        )))
    }
}
