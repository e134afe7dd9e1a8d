use crate::cache::EnvironmentCache;
use crate::config::ConfigLookup;
use crate::constants::{CANCEL_GRACE_PERIOD_SECS, SANDBOX_SHELL, STAGE_DIR_PREFIX};
use crate::context::ExecutionContext;
use crate::error::{Result, SandboxError};
use crate::logging::SandboxEvent;
use crate::proxy::ProxyCommand;
use crate::sandbox::{Sandbox, StageKind};
use crate::staging::{self, StageInfo, TargetStruct};
use crate::task::SandboxTask;
use crate::vars::EnvMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

/// Phases of a sandboxed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutorState {
    Init,
    StagingIn,
    CommandBuilt,
    Running,
    StagingOut,
    Done,
    Failed,
}

/// Summary of a successful sandboxed run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub sandbox: String,
    pub exit_code: i32,
    pub staged_in: usize,
    pub staged_out: usize,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Runs a task inside its sandbox by re-invoking it through the backend's
/// command, with stage-in before and stage-out after the subprocess.
pub struct ProxyExecutor {
    sandbox: Sandbox,
    ctx: Arc<ExecutionContext>,
    config: Arc<dyn ConfigLookup>,
    cache: Arc<EnvironmentCache>,
    grace_period: Duration,
    state: ExecutorState,
    events: Vec<SandboxEvent>,
}

impl ProxyExecutor {
    pub fn new(
        sandbox: Sandbox,
        ctx: Arc<ExecutionContext>,
        config: Arc<dyn ConfigLookup>,
        cache: Arc<EnvironmentCache>,
    ) -> Self {
        Self {
            sandbox,
            ctx,
            config,
            cache,
            grace_period: Duration::from_secs(CANCEL_GRACE_PERIOD_SECS),
            state: ExecutorState::Init,
            events: Vec::new(),
        }
    }

    /// Time a cancelled subprocess gets between SIGINT and SIGKILL
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn events(&self) -> &[SandboxEvent] {
        &self.events
    }

    /// Resolved sandbox environment, shared through the cache
    pub async fn environment(&self) -> Result<Arc<EnvMap>> {
        self.sandbox.environment(&self.cache).await
    }

    /// Run `task` in the sandbox, cancelling on Ctrl-C.
    ///
    /// Listening for Ctrl-C installs a process-wide SIGINT handler that stays
    /// in place afterwards, so Ctrl-C no longer terminates the host process by
    /// default. Hosts with their own signal handling should call
    /// `run_with_cancel` instead.
    pub async fn run(&mut self, task: &dyn SandboxTask) -> Result<RunReport> {
        self.run_with_cancel(task, async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run `task` in the sandbox; completion of `cancel` interrupts the subprocess
    pub async fn run_with_cancel<F>(&mut self, task: &dyn SandboxTask, cancel: F) -> Result<RunReport>
    where
        F: Future<Output = ()>,
    {
        self.state = ExecutorState::Init;
        self.events.clear();
        self.sandbox.stagein_info = None;
        self.sandbox.stageout_info = None;

        let result = self.execute(task, cancel).await;
        if let Err(e) = &result {
            tracing::error!(sandbox = %self.sandbox.key(), error = %e, "sandboxed run failed");
            self.state = ExecutorState::Failed;
        }
        result
    }

    async fn execute<F>(&mut self, task: &dyn SandboxTask, cancel: F) -> Result<RunReport>
    where
        F: Future<Output = ()>,
    {
        let started_at = Utc::now();
        let start = Instant::now();

        task.before_run()?;

        // Removed on every exit path when dropped
        self.state = ExecutorState::StagingIn;
        let tmp_dir = tempfile::Builder::new()
            .prefix(STAGE_DIR_PREFIX)
            .tempdir()?;
        let env = self.environment().await?;

        let inputs = task.inputs(&env);
        let staged_in = match self.prepare_stage(StageKind::In, task.stagein_mask(), inputs, tmp_dir.path())? {
            Some(info) => {
                let copied = staging::copy_in(&info.targets, &info.staged_targets)?;
                tracing::info!(files = copied, dir = %info.stage_dir.display(), "stage-in complete");
                self.events.push(SandboxEvent::StagedIn { files: copied });
                self.sandbox.stagein_info = Some(info);
                copied
            }
            None => 0,
        };
        let outputs = task.outputs(&env);
        self.sandbox.stageout_info =
            self.prepare_stage(StageKind::Out, task.stageout_mask(), outputs, tmp_dir.path())?;

        self.state = ExecutorState::CommandBuilt;
        let command = self.build_command(task)?;

        self.state = ExecutorState::Running;
        let exit_code = match self.run_command(task, &command, &env, cancel).await {
            Ok(code) => code,
            Err(e) => {
                // Outputs of a failed run are never staged out
                if let Err(hook_err) = task.after_run() {
                    tracing::warn!(error = %hook_err, "after_run hook failed after a failed run");
                }
                return Err(e);
            }
        };

        self.state = ExecutorState::StagingOut;
        let staged = self.stage_out();
        // Runs after stage-out so the hook sees the outputs in their final place
        let hook = task.after_run();
        let (staged_out, warnings) = staged?;
        hook?;

        self.state = ExecutorState::Done;
        Ok(RunReport {
            sandbox: self.sandbox.key(),
            exit_code,
            staged_in,
            staged_out,
            warnings,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Copy staged outputs back, returning the number of copies and one warning per missing output
    fn stage_out(&mut self) -> Result<(usize, Vec<String>)> {
        let Some(info) = &self.sandbox.stageout_info else {
            return Ok((0, Vec::new()));
        };
        let report = staging::copy_out(&info.staged_targets, &info.targets)?;
        tracing::info!(files = report.copied, missing = report.missing.len(), "stage-out complete");
        self.events.push(SandboxEvent::StagedOut {
            files: report.copied,
            missing: report.missing.len(),
        });
        let warnings = report
            .missing
            .iter()
            .map(|p| format!("output {} was not produced in the sandbox", p.display()))
            .collect();
        Ok((report.copied, warnings))
    }

    /// Mask and relocate `structure` into a fresh directory below `tmp_dir`.
    /// `None` when this direction is disabled or nothing is selected.
    fn prepare_stage(
        &self,
        kind: StageKind,
        pattern: staging::StageMask,
        structure: TargetStruct,
        tmp_dir: &Path,
    ) -> Result<Option<StageInfo>> {
        let Some(dir_name) = self.sandbox.stage_dir_name(self.config.as_ref(), kind) else {
            return Ok(None);
        };
        let Some(targets) = staging::mask(&pattern, &structure) else {
            tracing::debug!(direction = kind.label(), "nothing to stage");
            return Ok(None);
        };

        let stage_dir = tmp_dir.join(dir_name);
        std::fs::create_dir_all(&stage_dir)?;
        let staged_targets = staging::stage(&targets, &stage_dir)?;
        Ok(Some(StageInfo {
            targets,
            stage_dir,
            staged_targets,
        }))
    }

    fn build_command(&self, task: &dyn SandboxTask) -> Result<String> {
        let config = self.config.as_ref();
        let mut env = self.sandbox.build_env(Some(task), &self.ctx, config);
        let mut volumes = self.sandbox.build_volumes(Some(task), &self.ctx, config);

        let stages = [
            (StageKind::In, &self.sandbox.stagein_info),
            (StageKind::Out, &self.sandbox.stageout_info),
        ];
        for (kind, info) in stages {
            let Some(info) = info else { continue };
            let host_dir = info.stage_dir.to_string_lossy().into_owned();
            match self.sandbox.stage_mount(kind) {
                Some(mount) => {
                    volumes.insert(host_dir, mount.clone());
                    env.insert(kind.env_var(), mount);
                }
                None => env.insert(kind.env_var(), host_dir),
            }
        }

        let executable = self.sandbox.reentry_executable(config, task, &self.ctx);
        let mut proxy = ProxyCommand::for_task(task, executable);
        proxy.env = env;
        proxy.volumes = volumes;
        proxy.setup_cmds = task.sandbox_setup_cmds();
        proxy.user = Some(self.sandbox.user(config)?);

        let command = self.sandbox.build_command(&proxy)?;
        tracing::debug!(sandbox = %self.sandbox.key(), command = %command, "built sandbox command");
        Ok(command)
    }

    async fn run_command<F>(
        &mut self,
        task: &dyn SandboxTask,
        command: &str,
        env: &EnvMap,
        cancel: F,
    ) -> Result<i32>
    where
        F: Future<Output = ()>,
    {
        let sandbox = self.sandbox.key();
        let _banner = Banner::enter(task.task_id(), sandbox.clone());

        let mut cmd = Command::new(SANDBOX_SHELL);
        cmd.arg("-c")
            .arg(command)
            .env_clear()
            .envs(env.iter())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd.spawn()?;

        tokio::pin!(cancel);
        let status = tokio::select! {
            status = child.wait() => status?,
            _ = &mut cancel => {
                tracing::warn!(sandbox = %sandbox, "cancelling sandboxed run");
                signal_group(&child, Signal::Interrupt);
                if tokio::time::timeout(self.grace_period, child.wait()).await.is_err() {
                    tracing::warn!(sandbox = %sandbox, "sandboxed run ignored interrupt, killing it");
                    signal_group(&child, Signal::Kill);
                    child.start_kill()?;
                    child.wait().await?;
                }
                self.events.push(SandboxEvent::Cancelled { sandbox: sandbox.clone() });
                return Err(SandboxError::Cancelled { sandbox });
            }
        };

        let code = exit_code(&status);
        if code != 0 {
            self.events.push(SandboxEvent::CommandFailed {
                sandbox: sandbox.clone(),
                exit_code: code,
            });
            return Err(SandboxError::RunFailure { sandbox, code });
        }
        Ok(code)
    }
}

/// Logs the entering/leaving markers around the subprocess on every path
struct Banner {
    task_id: String,
    sandbox: String,
}

impl Banner {
    fn enter(task_id: String, sandbox: String) -> Self {
        tracing::info!(
            "{}",
            SandboxEvent::Entering {
                task_id: task_id.clone(),
                sandbox: sandbox.clone()
            }
        );
        Self { task_id, sandbox }
    }
}

impl Drop for Banner {
    fn drop(&mut self) {
        tracing::info!(
            "{}",
            SandboxEvent::Leaving {
                task_id: std::mem::take(&mut self.task_id),
                sandbox: std::mem::take(&mut self.sandbox)
            }
        );
    }
}

enum Signal {
    Interrupt,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: Signal) {
    let Some(pid) = child.id() else { return };
    let signal = match signal {
        Signal::Interrupt => libc::SIGINT,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: the child leads its own process group, so -pid only reaches it and its descendants
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: Signal) {}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
