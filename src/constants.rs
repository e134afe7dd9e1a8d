// Centralized constants for sandtask to avoid magic strings across modules

/// Separator between sandbox type and name in a sandbox key
pub const SANDBOX_KEY_DELIMITER: &str = "::";

/// Separator between multiple sandbox keys in the ambient identity list
pub const SANDBOX_LIST_SEPARATOR: char = ',';

/// Comma-separated list of sandbox keys the process currently runs in
pub const ENV_SANDBOX: &str = "SANDTASK_SANDBOX";

/// Set to "1" once the process was switched into a sandbox
pub const ENV_SANDBOX_SWITCHED: &str = "SANDTASK_SANDBOX_SWITCHED";

pub const ENV_SANDBOX_TASK_ID: &str = "SANDTASK_SANDBOX_TASK_ID";

pub const ENV_SANDBOX_ROOT_TASK_ID: &str = "SANDTASK_SANDBOX_ROOT_TASK_ID";

pub const ENV_SANDBOX_IS_ROOT_TASK: &str = "SANDTASK_SANDBOX_IS_ROOT_TASK";

pub const ENV_SANDBOX_WORKER_ID: &str = "SANDTASK_SANDBOX_WORKER_ID";

pub const ENV_SANDBOX_WORKER_FIRST_TASK_ID: &str = "SANDTASK_SANDBOX_WORKER_FIRST_TASK_ID";

/// Directory holding staged inputs, as seen from inside the sandbox
pub const ENV_SANDBOX_STAGEIN_DIR: &str = "SANDTASK_SANDBOX_STAGEIN_DIR";

/// Directory receiving staged outputs, as seen from inside the sandbox
pub const ENV_SANDBOX_STAGEOUT_DIR: &str = "SANDTASK_SANDBOX_STAGEOUT_DIR";

/// Default stage-in directory name below the per-run staging directory
pub const DEFAULT_STAGEIN_DIR_NAME: &str = "stagein";

/// Default stage-out directory name below the per-run staging directory
pub const DEFAULT_STAGEOUT_DIR_NAME: &str = "stageout";

/// Prefix of the per-run temporary staging directory
pub const STAGE_DIR_PREFIX: &str = "sandtask_stage_";

/// Executable used to re-enter the task inside a sandbox when nothing is configured
pub const DEFAULT_REENTRY_EXECUTABLE: &str = "sandtask";

/// Task parameters that only make sense outside of the sandbox
pub const DEFAULT_EXCLUDED_SANDBOX_PARAMS: &[&str] = &["sandbox", "log_file"];

/// Global parameters owned by the worker pool, never forwarded into a sandbox
pub const EXCLUDED_GLOBAL_PARAMS: &[&str] = &["workers"];

/// Shell used to run sandbox commands
pub const SANDBOX_SHELL: &str = "/bin/bash";

/// Time a cancelled subprocess gets to exit after SIGINT before it is killed (seconds)
pub const CANCEL_GRACE_PERIOD_SECS: u64 = 10;

/// Number of hex characters of the path hash used in unique basenames
pub const UNIQUE_BASENAME_HASH_LEN: usize = 12;
