use crate::constants::*;
use crate::error::{Result, SandboxError};
use crate::vars::EnvMap;
use serde::Serialize;
use std::path::PathBuf;

/// Snapshot of the ambient process state relevant to sandboxing, taken once
/// at process start and passed around explicitly.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionContext {
    /// Sandbox keys this process currently runs in, outermost first
    pub sandboxes: Vec<String>,
    pub switched: bool,
    pub task_id: Option<String>,
    pub worker_id: Option<String>,
    pub worker_first_task_id: Option<String>,
    pub is_root_task: bool,
    pub stagein_dir: Option<PathBuf>,
    pub stageout_dir: Option<PathBuf>,
    /// Full ambient environment, used when a task runs directly
    #[serde(skip)]
    pub environ: EnvMap,
}

impl ExecutionContext {
    /// Build the context from the environment of the current process.
    ///
    /// Names and values that are not valid UTF-8 are converted lossily.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars_os().map(|(k, v)| {
            (
                k.to_string_lossy().into_owned(),
                v.to_string_lossy().into_owned(),
            )
        }))
    }

    /// Build the context from an explicit set of variables
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let environ: EnvMap = vars.into_iter().collect();

        let non_empty = |name: &str| {
            environ
                .get(name)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let sandboxes: Vec<String> = environ
            .get(ENV_SANDBOX)
            .unwrap_or_default()
            .split(SANDBOX_LIST_SEPARATOR)
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();

        let ctx = Self {
            sandboxes,
            switched: environ.get(ENV_SANDBOX_SWITCHED) == Some("1"),
            task_id: non_empty(ENV_SANDBOX_TASK_ID),
            worker_id: non_empty(ENV_SANDBOX_WORKER_ID),
            worker_first_task_id: non_empty(ENV_SANDBOX_WORKER_FIRST_TASK_ID),
            is_root_task: environ.get(ENV_SANDBOX_IS_ROOT_TASK) == Some("1"),
            stagein_dir: non_empty(ENV_SANDBOX_STAGEIN_DIR).map(PathBuf::from),
            stageout_dir: non_empty(ENV_SANDBOX_STAGEOUT_DIR).map(PathBuf::from),
            environ,
        };
        ctx.validate()?;
        Ok(ctx)
    }

    fn validate(&self) -> Result<()> {
        if !self.switched {
            return Ok(());
        }
        if self.sandboxes.is_empty() {
            return Err(SandboxError::configuration(format!(
                "{} must not be empty in a sandbox",
                ENV_SANDBOX
            )));
        }
        if self.task_id.is_none() {
            return Err(SandboxError::configuration(format!(
                "{} must not be empty in a sandbox",
                ENV_SANDBOX_TASK_ID
            )));
        }
        if self.worker_id.is_none() {
            return Err(SandboxError::configuration(format!(
                "{} must not be empty in a sandbox",
                ENV_SANDBOX_WORKER_ID
            )));
        }
        Ok(())
    }

    /// The innermost designation a task should default to, if any
    pub fn current_sandbox(&self) -> Option<&str> {
        self.sandboxes.first().map(String::as_str)
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.sandboxes.iter().any(|k| k == key)
    }
}
