//! Lifecycle states and registry records.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use super::{
    Capability, DispatchGate, ErrorInfo, ErrorKind, Plugin, PluginManifest, PluginResult,
    ResolvedConfig, ValidatedPackage,
};

/// Lifecycle state of a plugin record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginState {
    /// No record exists.
    Unloaded,
    /// Package verified; dependencies and config being checked.
    Loading,
    /// Instance created; init entry point running.
    Initializing,
    /// Initialized, not yet accepting calls.
    Ready,
    /// Accepting capability calls.
    Active,
    /// Initialized, calls rejected.
    Disabled,
    /// Failed to load or initialize.
    Error,
    /// Cleanup in progress.
    Unloading,
}

impl PluginState {
    /// All states.
    pub const ALL: [Self; 8] = [
        Self::Unloaded,
        Self::Loading,
        Self::Initializing,
        Self::Ready,
        Self::Active,
        Self::Disabled,
        Self::Error,
        Self::Unloading,
    ];

    /// Check whether `self -> next` is in the transition table.
    pub fn can_transition_to(self, next: Self) -> bool {
        use PluginState::{Active, Disabled, Error, Initializing, Loading, Ready, Unloaded, Unloading};
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Initializing | Error)
                | (Initializing, Ready | Error)
                | (Ready, Active | Unloading)
                | (Active, Disabled | Unloading)
                | (Disabled, Active | Unloading)
                | (Error, Unloading)
                | (Unloading, Unloaded)
        )
    }

    /// Whether records in this state hold an instance.
    pub fn has_instance(self) -> bool {
        matches!(self, Self::Ready | Self::Active | Self::Disabled)
    }

    /// Upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unloaded => "UNLOADED",
            Self::Loading => "LOADING",
            Self::Initializing => "INITIALIZING",
            Self::Ready => "READY",
            Self::Active => "ACTIVE",
            Self::Disabled => "DISABLED",
            Self::Error => "ERROR",
            Self::Unloading => "UNLOADING",
        }
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call statistics for one record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStats {
    pub calls: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    /// Sum of call latencies in milliseconds.
    pub total_latency_ms: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl RecordStats {
    /// Record one finished call.
    pub fn record<T>(&mut self, latency: Duration, outcome: &PluginResult<T>) {
        self.calls += 1;
        self.total_latency_ms = self.total_latency_ms.saturating_add(latency.as_millis() as u64);
        self.last_activity = Some(Utc::now());
        if let Err(e) = outcome {
            self.failures += 1;
            match e.kind() {
                ErrorKind::CallTimeout => self.timeouts += 1,
                ErrorKind::Cancelled => self.cancelled += 1,
                _ => {}
            }
        }
    }

    /// Mean latency in milliseconds.
    pub fn average_latency_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.calls as f64
        }
    }
}

/// The registry's live entry for one plugin id.
pub struct PluginRecord {
    pub(crate) manifest: Arc<PluginManifest>,
    pub(crate) state: PluginState,
    pub(crate) instance: Option<Arc<dyn Plugin>>,
    pub(crate) config: Option<ResolvedConfig>,
    pub(crate) last_error: Option<ErrorInfo>,
    pub(crate) stats: RecordStats,
    pub(crate) gate: Arc<DispatchGate>,
    pub(crate) scratch: Option<Arc<TempDir>>,
    pub(crate) source: PathBuf,
    pub(crate) signed: bool,
    pub(crate) loaded_at: DateTime<Utc>,
    pub(crate) state_changed_at: DateTime<Utc>,
}

impl std::fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRecord")
            .field("id", &self.manifest.id)
            .field("version", &self.manifest.version)
            .field("state", &self.state)
            .field("has_instance", &self.instance.is_some())
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl PluginRecord {
    /// A LOADING record for a verified package.
    pub fn loading(package: &ValidatedPackage) -> Self {
        let manifest = Arc::new(package.manifest().clone());
        let mut record = Self::new(manifest, package.source().to_path_buf());
        record.signed = package.is_signed();
        record.scratch = Some(package.scratch_handle());
        record
    }

    /// A LOADING record for a manifest with no extracted payload.
    pub fn new(manifest: Arc<PluginManifest>, source: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            gate: Arc::new(DispatchGate::new(manifest.reentrant)),
            manifest,
            state: PluginState::Loading,
            instance: None,
            config: None,
            last_error: None,
            stats: RecordStats::default(),
            scratch: None,
            source,
            signed: false,
            loaded_at: now,
            state_changed_at: now,
        }
    }

    /// Plugin id.
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Loaded version.
    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    /// Current state.
    pub fn state(&self) -> PluginState {
        self.state
    }

    /// Validated manifest.
    pub fn manifest(&self) -> &Arc<PluginManifest> {
        &self.manifest
    }

    /// Running instance, present only in READY, ACTIVE and DISABLED.
    pub fn instance(&self) -> Option<&Arc<dyn Plugin>> {
        self.instance.as_ref()
    }

    /// Last applied configuration.
    pub fn config(&self) -> Option<&ResolvedConfig> {
        self.config.as_ref()
    }

    /// Failure that put the record in ERROR.
    pub fn last_error(&self) -> Option<&ErrorInfo> {
        self.last_error.as_ref()
    }

    /// Call statistics.
    pub fn stats(&self) -> &RecordStats {
        &self.stats
    }

    /// Dispatch gate.
    pub fn gate(&self) -> &Arc<DispatchGate> {
        &self.gate
    }

    /// Serializable view of this record.
    pub fn snapshot(&self) -> PluginSnapshot {
        PluginSnapshot {
            id: self.manifest.id.clone(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            provider: self.manifest.provider.clone(),
            state: self.state,
            capabilities: self.manifest.capability_tags(),
            has_instance: self.instance.is_some(),
            config: self.config.clone(),
            last_error: self.last_error.clone(),
            stats: self.stats.clone(),
            inflight: self.gate.inflight(),
            source: self.source.clone(),
            signed: self.signed,
            loaded_at: self.loaded_at,
            state_changed_at: self.state_changed_at,
        }
    }
}

/// Serializable view of a plugin record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSnapshot {
    pub id: String,
    pub name: String,
    pub version: String,
    pub provider: String,
    pub state: PluginState,
    pub capabilities: Vec<Capability>,
    pub has_instance: bool,
    pub config: Option<ResolvedConfig>,
    pub last_error: Option<ErrorInfo>,
    pub stats: RecordStats,
    pub inflight: usize,
    pub source: PathBuf,
    pub signed: bool,
    pub loaded_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
}

/// A requested state change with its payload.
#[derive(Default)]
pub struct Transition {
    pub(crate) to: Option<PluginState>,
    pub(crate) instance: Option<Arc<dyn Plugin>>,
    pub(crate) config: Option<ResolvedConfig>,
    pub(crate) error: Option<ErrorInfo>,
}

impl Transition {
    /// Move to `state`.
    pub fn to(state: PluginState) -> Self {
        Self { to: Some(state), ..Self::default() }
    }

    /// Attach an instance (required to enter READY).
    pub fn with_instance(mut self, instance: Arc<dyn Plugin>) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Record the applied configuration.
    pub fn with_config(mut self, config: ResolvedConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Record the failure (used when entering ERROR).
    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    /// Target state.
    pub fn target(&self) -> Option<PluginState> {
        self.to
    }
}
