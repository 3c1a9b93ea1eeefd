//! Error types shared across subsystems.

use std::path::PathBuf;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Filesystem persistence errors for plugin artifacts and failure records.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error at {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("Failed to serialize {what}: {reason}")]
    Serialize { what: String, reason: String },

    #[error("Corrupt artifact file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Artifact '{name}' already exists in {membership}")]
    AlreadyExists { name: String, membership: String },

    #[error("Invalid artifact name '{name}'")]
    InvalidName { name: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

/// Version archive errors.
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("IO error at {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("Failed to serialize snapshot: {0}")]
    Serialize(String),

    #[error("Snapshot {label} of '{name}' failed integrity check")]
    IntegrityMismatch { name: String, label: String },

    #[error("Could not allocate a version label for '{name}' after {attempts} attempts")]
    LabelContention { name: String, attempts: u32 },

    #[error("Invalid version label '{0}'")]
    InvalidLabel(String),
}

/// Errors surfaced by plugin registry mutations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin '{name}' not found")]
    NotFound { name: String },

    #[error("Plugin '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("Invalid plugin name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Code is {size} bytes, exceeding the {max} byte limit")]
    CodeTooLarge { size: usize, max: usize },

    #[error("Creating new plugins is disabled by configuration")]
    GenerationDisabled,

    #[error("Cannot {action} plugin '{name}' while it is {state}")]
    InvalidTransition {
        name: String,
        action: String,
        state: String,
    },

    #[error("Invalid manifest for '{name}': {reason}")]
    InvalidManifest { name: String, reason: String },

    #[error("Version {label} of '{name}' not found")]
    VersionNotFound { name: String, label: String },

    #[error("Version {label} of '{name}' no longer passes validation: {issues:?}")]
    RollbackRejected {
        name: String,
        label: String,
        issues: Vec<String>,
    },

    #[error("Failed to load plugin '{name}': {reason}")]
    Load { name: String, reason: String },

    #[error("Tool '{tool}' of plugin '{name}' is already registered by {holder}")]
    ToolNameTaken {
        name: String,
        tool: String,
        holder: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Version(#[from] VersionError),
}

/// Error returned by a hook callback. Always contained by the bus.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Hook failed: {0}")]
    Failed(String),

    #[error("Hook timed out after {0:?}")]
    Timeout(std::time::Duration),
}
