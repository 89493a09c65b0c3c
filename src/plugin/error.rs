//! Plugin runtime error types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::PluginState;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors that can occur during plugin operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The package is not a readable archive or lacks its manifest.
    #[error("Malformed package: {0}")]
    MalformedPackage(String),

    /// The manifest is missing fields, mistyped, or internally inconsistent.
    #[error("Invalid plugin manifest: {0}")]
    InvalidManifest(String),

    /// Checksum or signature verification failed.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// A declared dependency (or the host version) is absent or incompatible.
    #[error("Dependency error for plugin '{plugin}': {message}")]
    Dependency { plugin: String, message: String },

    /// The resolved configuration violates the plugin's schema.
    #[error("Invalid configuration field '{field}': {message}")]
    Validation { field: String, message: String },

    /// The init entry point did not return in time.
    #[error("Plugin '{0}' did not initialize within {1:?}")]
    InitTimeout(String, Duration),

    /// The init entry point returned an error.
    #[error("Plugin '{plugin}' failed to initialize: {message}")]
    InitFailure { plugin: String, message: String },

    /// A lifecycle request that the state machine does not allow.
    #[error("Cannot {requested} plugin '{plugin}' while it is {from}")]
    InvalidTransition { plugin: String, from: PluginState, requested: String },

    /// Dispatch to a plugin that is not ACTIVE.
    #[error("Plugin '{plugin}' is not ready (state: {state})")]
    NotReady { plugin: String, state: PluginState },

    /// A capability call exceeded its deadline.
    #[error("Call to plugin '{0}' timed out after {1:?}")]
    CallTimeout(String, Duration),

    /// A capability call failed inside the plugin.
    #[error("Plugin execution failed: {0}")]
    RuntimeFailure(String),

    /// No record exists for the plugin id.
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// A record for this id already exists and the load was not an upgrade.
    #[error("Plugin '{0}' is already loaded")]
    AlreadyLoaded(String),

    /// The plugin does not provide the requested capability.
    #[error("Plugin '{plugin}' does not provide capability '{capability}'")]
    Unsupported { plugin: String, capability: String },

    /// The call was cancelled while the plugin was being drained.
    #[error("Call to plugin '{0}' was cancelled")]
    Cancelled(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Host configuration or admin store error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An error reported across a process or stream boundary.
    #[error("{}", .0.message)]
    Remote(ErrorInfo),
}

/// Classification of a [`PluginError`], stable across the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    MalformedPackage,
    InvalidManifest,
    IntegrityError,
    DependencyError,
    ValidationError,
    InitTimeout,
    InitFailure,
    InvalidTransition,
    NotReady,
    CallTimeout,
    RuntimeFailure,
    NotFound,
    AlreadyLoaded,
    Unsupported,
    Cancelled,
    Io,
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl PluginError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedPackage(_) => ErrorKind::MalformedPackage,
            Self::InvalidManifest(_) => ErrorKind::InvalidManifest,
            Self::Integrity(_) => ErrorKind::IntegrityError,
            Self::Dependency { .. } => ErrorKind::DependencyError,
            Self::Validation { .. } => ErrorKind::ValidationError,
            Self::InitTimeout(..) => ErrorKind::InitTimeout,
            Self::InitFailure { .. } => ErrorKind::InitFailure,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::CallTimeout(..) => ErrorKind::CallTimeout,
            Self::RuntimeFailure(_) => ErrorKind::RuntimeFailure,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyLoaded(_) => ErrorKind::AlreadyLoaded,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
            Self::Remote(info) => info.kind,
        }
    }

    /// Shorthand for a validation error on `field`.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }

    /// Shorthand for a dependency error on `plugin`.
    pub fn dependency(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dependency { plugin: plugin.into(), message: message.into() }
    }

    /// Snapshot of this error for records and RPC responses.
    pub fn info(&self) -> ErrorInfo {
        if let Self::Remote(info) = self {
            return info.clone();
        }
        ErrorInfo { kind: self.kind(), message: self.to_string() }
    }
}

/// Serializable error snapshot: a kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<ErrorInfo> for PluginError {
    fn from(info: ErrorInfo) -> Self {
        Self::Remote(info)
    }
}
