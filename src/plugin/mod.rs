//! Plugin lifecycle runtime.
//!
//! This module admits third-party capability providers (embedding, rerank,
//! chat) into a running host from signed `.xpkg` packages, and governs
//! every loaded plugin through an explicit state machine.
//!
//! # Architecture
//!
//! - **Package reader** (`package`, `signing`): archive parsing, manifest
//!   validation, checksum and signature verification, payload extraction.
//! - **Config resolver** (`resolver`, `schema`): four-layer settings merge
//!   validated against the plugin's schema.
//! - **Contracts** (`contract`, `stream`): what a plugin instance exposes.
//! - **Registry** (`registry`, `record`, `gate`): records keyed by id, the
//!   transition table, and per-record dispatch gates.
//! - **Loader** (`loader`, `host`, `process`): packages to initialized
//!   instances through a host.
//! - **Manager** (`manager`): discovery, lifecycle operations and dispatch.
//!
//! # Lifecycle
//!
//! ```text
//! UNLOADED → LOADING → INITIALIZING → READY → ACTIVE ⇄ DISABLED
//!               ↓            ↓           ↓       ↓        ↓
//!             ERROR ───────────────→ UNLOADING → UNLOADED
//! ```
//!
//! # Example Configuration
//!
//! ```toml
//! [runtime]
//! plugins_dir = "~/.local/share/caphost/plugins"
//! auto_enable = true
//!
//! [plugins.dashscope]
//! api_key = "sk-..."
//! dimensions = 1024
//! ```

mod contract;
mod error;
mod gate;
mod host;
mod loader;
mod manager;
mod manifest;
mod package;
mod process;
mod record;
mod registry;
mod resolver;
mod schema;
pub mod signing;
mod stream;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use contract::{
    CallContext, CapabilityRequest, CapabilityResponse, ChatModel, Embedder, Plugin, Reranker,
};
pub use error::{ErrorInfo, ErrorKind, PluginError, PluginResult};
pub use gate::{CallPermit, DispatchGate, DrainOutcome};
pub use host::{BuiltinHost, HostRouter, PluginFactory, PluginHost};
pub use loader::Loader;
pub use manager::{
    DiscoveryFailure, DiscoveryReport, ManagerOptions, PluginManager, UpgradePolicy,
};
pub use manifest::{is_valid_id, CapabilityDecl, Entrypoint, EntrypointKind, PluginManifest};
pub use package::{PackageBuilder, PackageReader, ReaderOptions, ValidatedPackage};
pub use process::{ProcessHost, ProcessPlugin};
pub use record::{PluginRecord, PluginSnapshot, PluginState, RecordStats, Transition};
pub use registry::{DispatchTarget, PluginRegistry, TransitionGuard};
pub use resolver::{
    env_prefix, AdminConfigStore, AdminEntry, ConfigResolver, ConfigSource, EnvSource,
    FileAdminStore, MemoryAdminStore, ResolvedConfig,
};
pub use schema::{ConfigSchema, PropertySchema, SchemaType};
pub use signing::TrustedKeys;
pub use stream::{chat_channel, ChatEvent, ChatStream, ChunkSink, DEFAULT_STREAM_BUFFER};
pub use types::{
    Capability, ChatChoice, ChatChunk, ChatMessage, ChatRequest, ChatResponse, ChatUsage,
    PluginInfo, RerankDocument, RerankResult, MANIFEST_FILE, PACKAGE_EXTENSION, PROCESS_BINARY,
    SCHEMA_FILE,
};
