use crate::cache::EnvironmentCache;
use crate::config::ConfigLookup;
use crate::constants::{ENV_SANDBOX_STAGEIN_DIR, ENV_SANDBOX_STAGEOUT_DIR};
use crate::context::ExecutionContext;
use crate::error::{Result, SandboxError};
use crate::executor::{ProxyExecutor, RunReport};
use crate::sandbox::{self, SandboxRegistry, StageKind};
use crate::staging::{self, StageMask, TargetStruct};
use crate::task::SandboxTask;
use crate::vars::EnvMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

/// Resolution state of a task's sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    Resolving,
    /// The task runs its own logic in this process; `effective` may be empty
    Direct { effective: String },
    /// The task is re-invoked inside `effective` through a proxy executor
    Sandboxed { effective: String },
}

/// What `SandboxController::run` ended up doing
#[derive(Debug)]
pub enum RunOutcome {
    Direct,
    Sandboxed(RunReport),
}

/// Task-facing entry point: decides whether a task runs directly or through
/// its sandbox, and dispatches `run` accordingly.
pub struct SandboxController<'r> {
    task: Arc<dyn SandboxTask>,
    registry: &'r SandboxRegistry,
    cache: Arc<EnvironmentCache>,
    config: Arc<dyn ConfigLookup>,
    ctx: Arc<ExecutionContext>,
    state: ControllerState,
    executor: Option<ProxyExecutor>,
}

impl SandboxController<'static> {
    /// Controller using the global registry and cache and the ambient process state
    pub fn new(task: Arc<dyn SandboxTask>, config: Arc<dyn ConfigLookup>) -> Result<Self> {
        Ok(Self::with_parts(
            task,
            SandboxRegistry::global(),
            EnvironmentCache::global(),
            config,
            Arc::new(ExecutionContext::from_env()?),
        ))
    }
}

impl<'r> SandboxController<'r> {
    pub fn with_parts(
        task: Arc<dyn SandboxTask>,
        registry: &'r SandboxRegistry,
        cache: Arc<EnvironmentCache>,
        config: Arc<dyn ConfigLookup>,
        ctx: Arc<ExecutionContext>,
    ) -> Self {
        Self {
            task,
            registry,
            cache,
            config,
            ctx,
            state: ControllerState::Uninitialized,
            executor: None,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn executor(&self) -> Option<&ProxyExecutor> {
        self.executor.as_ref()
    }

    /// Resolve the effective sandbox once; `force` discards a previous resolution
    pub fn initialize(&mut self, force: bool) -> Result<()> {
        if !force && !matches!(self.state, ControllerState::Uninitialized) {
            return Ok(());
        }
        self.state = ControllerState::Resolving;
        self.executor = None;

        match self.resolve() {
            Ok(state) => {
                tracing::debug!(task = %self.task.task_id(), state = ?state, "sandbox resolved");
                self.state = state;
                Ok(())
            }
            Err(e) => {
                self.state = ControllerState::Uninitialized;
                Err(e)
            }
        }
    }

    fn resolve(&mut self) -> Result<ControllerState> {
        // Never nest: inside a sandbox the task always runs directly
        if self.ctx.switched {
            let effective = self.ctx.current_sandbox().unwrap_or_default().to_string();
            return Ok(ControllerState::Direct { effective });
        }

        let task = self.task.clone();
        let mut designation = task.sandbox().trim().to_string();
        if designation.is_empty() && !task.allow_empty_sandbox() {
            return Err(SandboxError::MissingSandbox {
                task: task.task_id(),
            });
        }

        if !designation.is_empty() && !matches_any(&designation, &task.valid_sandboxes()) {
            let fallback = task.fallback_sandbox(&designation).unwrap_or_default();
            tracing::info!(
                task = %task.task_id(),
                sandbox = %designation,
                fallback = %fallback,
                "sandbox not allowed for task, using fallback"
            );
            designation = fallback.trim().to_string();
        }

        if designation.is_empty() {
            if task.allow_empty_sandbox() {
                return Ok(ControllerState::Direct {
                    effective: designation,
                });
            }
            return Err(SandboxError::MissingSandbox {
                task: task.task_id(),
            });
        }

        sandbox::key::validate(&designation)?;
        if self.ctx.is_active(&designation) {
            return Ok(ControllerState::Direct {
                effective: designation,
            });
        }

        let sandbox = self.registry.resolve(&designation, self.config.as_ref())?;
        self.executor = Some(ProxyExecutor::new(
            sandbox,
            self.ctx.clone(),
            self.config.clone(),
            self.cache.clone(),
        ));
        Ok(ControllerState::Sandboxed {
            effective: designation,
        })
    }

    pub fn effective_sandbox(&mut self) -> Result<String> {
        self.initialize(false)?;
        Ok(match &self.state {
            ControllerState::Direct { effective } | ControllerState::Sandboxed { effective } => {
                effective.clone()
            }
            _ => String::new(),
        })
    }

    pub fn is_sandboxed(&mut self) -> Result<bool> {
        self.initialize(false)?;
        Ok(matches!(self.state, ControllerState::Sandboxed { .. }))
    }

    /// Ambient environment when running directly, the sandbox environment otherwise
    pub async fn environment(&mut self) -> Result<Arc<EnvMap>> {
        self.initialize(false)?;
        match &self.executor {
            Some(executor) => executor.environment().await,
            None => Ok(Arc::new(self.ctx.environ.clone())),
        }
    }

    /// Inputs as the task sees them inside its sandbox: masked targets point into the stage-in directory
    pub async fn staged_input(&mut self) -> Result<TargetStruct> {
        let dir = self.stage_dir(StageKind::In)?;
        let env = self.environment().await?;
        let inputs = self.task.inputs(&env);
        staged_view(&self.task.stagein_mask(), &inputs, &dir)
    }

    /// Outputs as the task sees them inside its sandbox: masked targets point into the stage-out directory
    pub async fn staged_output(&mut self) -> Result<TargetStruct> {
        let dir = self.stage_dir(StageKind::Out)?;
        let env = self.environment().await?;
        let outputs = self.task.outputs(&env);
        staged_view(&self.task.stageout_mask(), &outputs, &dir)
    }

    fn stage_dir(&self, kind: StageKind) -> Result<std::path::PathBuf> {
        let (dir, variable) = match kind {
            StageKind::In => (&self.ctx.stagein_dir, ENV_SANDBOX_STAGEIN_DIR),
            StageKind::Out => (&self.ctx.stageout_dir, ENV_SANDBOX_STAGEOUT_DIR),
        };
        match dir {
            Some(dir) if self.ctx.switched => Ok(dir.clone()),
            _ => Err(SandboxError::StagingContext {
                variable,
                direction: kind.label(),
            }),
        }
    }

    /// Inside a sandbox the ambient root flag has to agree as well
    pub fn is_root_task(&self) -> bool {
        if self.ctx.switched {
            self.ctx.is_root_task && self.task.is_root_task()
        } else {
            self.task.is_root_task()
        }
    }

    /// User and group ids used for the effective sandbox
    pub fn sandbox_user(&mut self) -> Result<(u32, u32)> {
        self.initialize(false)?;
        let config = self.config.as_ref();
        if let Some(executor) = &self.executor {
            return executor.sandbox().user(config);
        }
        match &self.state {
            ControllerState::Direct { effective } if !effective.is_empty() => {
                self.registry.resolve(effective, config)?.user(config)
            }
            _ => Ok(sandbox::current_user()),
        }
    }

    /// Run the task: its own logic when direct, the proxy executor otherwise.
    ///
    /// A sandboxed run listens for Ctrl-C, which replaces the default SIGINT
    /// behaviour of the whole process for good; use `run_with_cancel` to keep
    /// signal handling in the host's hands.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        self.initialize(false)?;
        let task = self.task.clone();
        match self.executor.as_mut() {
            Some(executor) => Ok(RunOutcome::Sandboxed(executor.run(task.as_ref()).await?)),
            None => {
                task.run()?;
                Ok(RunOutcome::Direct)
            }
        }
    }

    /// Like `run`, interrupting a sandboxed subprocess when `cancel` completes
    pub async fn run_with_cancel<F>(&mut self, cancel: F) -> Result<RunOutcome>
    where
        F: Future<Output = ()>,
    {
        self.initialize(false)?;
        let task = self.task.clone();
        match self.executor.as_mut() {
            Some(executor) => Ok(RunOutcome::Sandboxed(
                executor.run_with_cancel(task.as_ref(), cancel).await?,
            )),
            None => {
                task.run()?;
                Ok(RunOutcome::Direct)
            }
        }
    }
}

fn matches_any(designation: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| {
        glob::Pattern::new(p)
            .map(|pattern| pattern.matches(designation))
            .unwrap_or(p == designation)
    })
}

/// Relocate the parts selected by `pattern` into `dir`, leaving everything else untouched.
/// The whole structure is relocated so that sequence positions stay aligned for the overlay.
fn staged_view(pattern: &StageMask, structure: &TargetStruct, dir: &Path) -> Result<TargetStruct> {
    if staging::mask(pattern, structure).is_none() {
        return Ok(structure.clone());
    }
    let staged = staging::stage(structure, dir)?;
    Ok(staging::overlay(pattern, &staged, structure))
}
