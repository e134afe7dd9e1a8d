use std::io;
/// Structured logging utilities for sandtask
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Initialize structured logging with optional JSON output
pub fn init_logging(json_output: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sandtask=info"));

    let registry = Registry::default().with(env_filter);

    if json_output {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_current_span(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::ACTIVE),
            )
            .try_init()?;
    } else {
        // stdout belongs to the sandboxed process, keep logs on stderr
        registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    }

    Ok(())
}

#[macro_export]
macro_rules! log_env_resolved {
    ($backend:expr, $key:expr, $vars:expr, $cached:expr) => {
        tracing::debug!(
            backend = %$backend,
            cache_key = %$key,
            variables = $vars,
            cached = $cached,
            "Sandbox environment resolved"
        );
    };
}

#[macro_export]
macro_rules! log_stage_in {
    ($from:expr, $to:expr) => {
        tracing::debug!(from = %$from.display(), to = %$to.display(), "stage-in");
    };
}

#[macro_export]
macro_rules! log_stage_out {
    ($from:expr, $to:expr) => {
        tracing::debug!(from = %$from.display(), to = %$to.display(), "stage-out");
    };
}

/// Lifecycle events of a sandboxed run
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxEvent {
    Entering { task_id: String, sandbox: String },
    Leaving { task_id: String, sandbox: String },
    StagedIn { files: usize },
    StagedOut { files: usize, missing: usize },
    CommandFailed { sandbox: String, exit_code: i32 },
    Cancelled { sandbox: String },
}

impl std::fmt::Display for SandboxEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entering { task_id, sandbox } => {
                write!(f, "entering sandbox {} (task {})", sandbox, task_id)
            }
            Self::Leaving { task_id, sandbox } => {
                write!(f, "leaving sandbox {} (task {})", sandbox, task_id)
            }
            Self::StagedIn { files } => write!(f, "staged-in {} file(s)", files),
            Self::StagedOut { files, missing } => {
                write!(f, "staged-out {} file(s), {} missing", files, missing)
            }
            Self::CommandFailed { sandbox, exit_code } => {
                write!(f, "sandbox {} exited with code {}", sandbox, exit_code)
            }
            Self::Cancelled { sandbox } => write!(f, "sandbox {} run cancelled", sandbox),
        }
    }
}
