/// sandtask error types and handling utilities
use std::path::PathBuf;

/// Main error type for sandbox resolution, staging and execution
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Malformed `type::name` sandbox key
    #[error("invalid sandbox key '{key}': {reason}")]
    Format { key: String, reason: String },
    /// No backend registered for the requested sandbox type
    #[error("no sandbox backend registered for type '{sandbox_type}'")]
    UnknownSandboxType { sandbox_type: String },
    /// Two backends tried to claim the same type tag
    #[error("sandbox type '{sandbox_type}' is already registered")]
    DuplicateSandboxType { sandbox_type: String },
    /// The task requires a sandbox but none was designated
    #[error("task {task} requires a sandbox to be set")]
    MissingSandbox { task: String },
    /// Two different targets would be staged to the same location
    #[error("staged basename '{name}' collides for {first:?} and {second:?}")]
    NamingCollision {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
    /// A staged view was requested outside of sandboxed execution
    #[error("{variable} must be set inside a sandbox when {direction} staging is required")]
    StagingContext {
        variable: &'static str,
        direction: &'static str,
    },
    /// The sandboxed subprocess exited with a non-zero code
    #[error("sandbox '{sandbox}' failed with exit code {code}, see the output of the sandboxed process for details")]
    RunFailure { sandbox: String, code: i32 },
    /// The sandboxed subprocess was interrupted
    #[error("sandbox '{sandbox}' run was cancelled")]
    Cancelled { sandbox: String },
    /// Required ambient state or configuration is missing or invalid
    #[error("configuration error: {reason}")]
    Configuration { reason: String },
    /// A backend could not resolve its environment
    #[error("failed to resolve environment of sandbox type '{sandbox_type}' (cache key '{cache_key}'): {reason}")]
    Environment {
        sandbox_type: String,
        cache_key: String,
        reason: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Wrapped anyhow error for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    pub fn format(key: &str, reason: impl Into<String>) -> Self {
        Self::Format {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Exit code of a failed sandboxed run, if that is what this error is
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::RunFailure { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Helper to determine if an error could be worth retrying by the caller.
///
/// Nothing in this crate retries; schedulers use this to pick a policy.
pub fn is_retryable(err: &SandboxError) -> bool {
    match err {
        SandboxError::RunFailure { .. } => true,
        SandboxError::Environment { .. } => true,
        SandboxError::Io(_) => true,
        SandboxError::Format { .. } => false,
        SandboxError::UnknownSandboxType { .. } => false,
        SandboxError::DuplicateSandboxType { .. } => false,
        SandboxError::MissingSandbox { .. } => false,
        SandboxError::NamingCollision { .. } => false,
        SandboxError::StagingContext { .. } => false,
        SandboxError::Cancelled { .. } => false,
        SandboxError::Configuration { .. } => false,
        SandboxError::Other(_) => false,
    }
}
