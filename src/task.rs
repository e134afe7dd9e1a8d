use crate::constants::{DEFAULT_EXCLUDED_SANDBOX_PARAMS, DEFAULT_REENTRY_EXECUTABLE};
use crate::staging::{StageMask, TargetStruct};
use crate::vars::{EnvMap, VolumeMap};

/// What the sandbox engine needs to know about a task.
///
/// Implemented by the task framework. Only identity, designation, inputs,
/// outputs and `run` are required; everything else has the neutral default.
pub trait SandboxTask: Send + Sync {
    /// Unique id of this task instance
    fn task_id(&self) -> String;

    /// Name the task framework uses to instantiate the task again
    fn family(&self) -> String;

    /// Task parameters as `(name, serialized value)`
    fn params(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Global (worker level) parameters as `(name, serialized value)`
    fn global_params(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Declared sandbox designation, empty for none
    fn sandbox(&self) -> String;

    /// Glob patterns of acceptable designations
    fn valid_sandboxes(&self) -> Vec<String> {
        vec!["*".to_string()]
    }

    fn allow_empty_sandbox(&self) -> bool {
        false
    }

    /// Replacement designation for one that is not in `valid_sandboxes`
    fn fallback_sandbox(&self, _sandbox: &str) -> Option<String> {
        None
    }

    /// Parameters never forwarded into the sandbox
    fn excluded_sandbox_params(&self) -> Vec<String> {
        DEFAULT_EXCLUDED_SANDBOX_PARAMS
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Input targets as seen under the environment `env`
    fn inputs(&self, env: &EnvMap) -> TargetStruct;

    /// Output targets as seen under the environment `env`
    fn outputs(&self, env: &EnvMap) -> TargetStruct;

    fn stagein_mask(&self) -> StageMask {
        StageMask::Nothing
    }

    fn stageout_mask(&self) -> StageMask {
        StageMask::Nothing
    }

    /// Extra variables on top of `env`
    fn sandbox_env(&self, _env: &EnvMap) -> EnvMap {
        EnvMap::new()
    }

    /// Extra mounts on top of `volumes`
    fn sandbox_volumes(&self, _volumes: &VolumeMap) -> VolumeMap {
        VolumeMap::new()
    }

    /// Shell commands run inside the sandbox before the task is re-entered
    fn sandbox_setup_cmds(&self) -> Vec<String> {
        Vec::new()
    }

    /// Executable re-entering the task when the sandbox config sets none
    fn reentry_executable(&self) -> String {
        DEFAULT_REENTRY_EXECUTABLE.to_string()
    }

    fn before_run(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_run(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_root_task(&self) -> bool {
        true
    }

    fn root_task_id(&self) -> String {
        self.task_id()
    }

    fn worker_id(&self) -> Option<String> {
        None
    }

    fn worker_first_task_id(&self) -> Option<String> {
        None
    }

    /// The task's own logic, used when it runs directly
    fn run(&self) -> anyhow::Result<()>;
}
