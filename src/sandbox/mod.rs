use crate::cache::EnvironmentCache;
use crate::config::{expand_vars, ConfigLookup};
use crate::constants::*;
use crate::context::ExecutionContext;
use crate::error::{Result, SandboxError};
use crate::proxy::{split_words, ProxyCommand};
use crate::staging::StageInfo;
use crate::task::SandboxTask;
use crate::vars::{EnvMap, VolumeMap};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;

pub mod bash;
pub mod docker;
pub mod key;
pub mod registry;

pub use key::SandboxKey;
pub use registry::{BackendConstructor, SandboxRegistry};

/// Direction of file staging across the sandbox boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    In,
    Out,
}

impl StageKind {
    pub fn label(&self) -> &'static str {
        match self {
            StageKind::In => "stage-in",
            StageKind::Out => "stage-out",
        }
    }

    pub fn env_var(&self) -> &'static str {
        match self {
            StageKind::In => ENV_SANDBOX_STAGEIN_DIR,
            StageKind::Out => ENV_SANDBOX_STAGEOUT_DIR,
        }
    }

    fn dir_name_option(&self) -> &'static str {
        match self {
            StageKind::In => "stagein_dir_name",
            StageKind::Out => "stageout_dir_name",
        }
    }

    fn default_dir_name(&self) -> &'static str {
        match self {
            StageKind::In => DEFAULT_STAGEIN_DIR_NAME,
            StageKind::Out => DEFAULT_STAGEOUT_DIR_NAME,
        }
    }
}

/// Capability contract every sandbox implementation provides
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Registry tag of this backend, e.g. "docker"
    fn sandbox_type(&self) -> &str;

    /// Key under which the resolved environment is memoized for this backend type
    fn env_cache_key(&self) -> String;

    /// Compute the environment the sandboxed command runs with. May be expensive.
    async fn resolve_environment(&self) -> anyhow::Result<EnvMap>;

    /// Wrap the generic re-entry command in backend specific isolation syntax
    fn build_command(&self, proxy: &ProxyCommand) -> anyhow::Result<String>;

    /// Path at which a host staging directory is visible inside the sandbox.
    /// `None` means the host path is visible as is; otherwise it is mounted there.
    fn stage_mount(&self, _kind: StageKind) -> Option<String> {
        None
    }
}

/// A resolved sandbox for a single task invocation
pub struct Sandbox {
    name: String,
    backend: Box<dyn SandboxBackend>,
    pub stagein_info: Option<StageInfo>,
    pub stageout_info: Option<StageInfo>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("key", &self.key())
            .field("stagein_info", &self.stagein_info)
            .field("stageout_info", &self.stageout_info)
            .finish()
    }
}

impl Sandbox {
    pub fn new(name: &str, backend: Box<dyn SandboxBackend>) -> Self {
        Self {
            name: name.to_string(),
            backend,
            stagein_info: None,
            stageout_info: None,
        }
    }

    pub fn sandbox_type(&self) -> &str {
        self.backend.sandbox_type()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> String {
        key::join(self.sandbox_type(), &self.name)
    }

    pub fn env_cache_key(&self) -> String {
        self.backend.env_cache_key()
    }

    pub fn backend(&self) -> &dyn SandboxBackend {
        self.backend.as_ref()
    }

    pub fn is_active(&self, ctx: &ExecutionContext) -> bool {
        ctx.is_active(&self.key())
    }

    /// Config section for this sandbox, preferring a `<section>_<name>` variant when defined
    pub fn config_section(&self, config: &dyn ConfigLookup, postfix: Option<&str>) -> String {
        config_section(self.sandbox_type(), &self.name, postfix, config)
    }

    /// Resolved environment, memoized per backend type and cache key
    pub async fn environment(&self, cache: &EnvironmentCache) -> Result<Arc<EnvMap>> {
        let sandbox_type = self.sandbox_type().to_string();
        let cache_key = self.env_cache_key();
        let backend = self.backend.as_ref();
        cache
            .get_or_create(&sandbox_type, &cache_key, || async move {
                backend.resolve_environment().await
            })
            .await
    }

    /// Variables exported inside the sandbox: defaults, then config, then task overrides
    pub fn build_env(
        &self,
        task: Option<&dyn SandboxTask>,
        ctx: &ExecutionContext,
        config: &dyn ConfigLookup,
    ) -> EnvMap {
        let mut env = EnvMap::new();

        env.insert(ENV_SANDBOX, self.key().replace('$', r"\$"));
        env.insert(ENV_SANDBOX_SWITCHED, "1");
        if let Some(task) = task {
            env.insert(ENV_SANDBOX_TASK_ID, task.task_id());
            env.insert(ENV_SANDBOX_ROOT_TASK_ID, task.root_task_id());
            env.insert(
                ENV_SANDBOX_IS_ROOT_TASK,
                if task.is_root_task() { "1" } else { "0" },
            );
            if let Some(worker_id) = task.worker_id() {
                env.insert(ENV_SANDBOX_WORKER_ID, worker_id);
            }
            if let Some(first_task_id) = task.worker_first_task_id() {
                env.insert(ENV_SANDBOX_WORKER_FIRST_TASK_ID, first_task_id);
            }
        }

        let section = self.config_section(config, Some("env"));
        for (name, value) in config.items(&section) {
            let names: Vec<String> = match glob::Pattern::new(&name) {
                Ok(pattern) if is_pattern(&name) => ctx
                    .environ
                    .keys()
                    .filter(|k| pattern.matches(k))
                    .map(str::to_string)
                    .collect(),
                _ => vec![name],
            };
            for name in names {
                let value = match &value {
                    Some(v) => v.clone(),
                    None => ctx.environ.get(&name).unwrap_or_default().to_string(),
                };
                env.insert(name, value);
            }
        }

        if let Some(task) = task {
            let task_env = task.sandbox_env(&env);
            env.update(&task_env);
        }

        env
    }

    /// Mounts from config (host paths expanded) followed by task overrides
    pub fn build_volumes(
        &self,
        task: Option<&dyn SandboxTask>,
        ctx: &ExecutionContext,
        config: &dyn ConfigLookup,
    ) -> VolumeMap {
        let mut volumes = VolumeMap::new();

        let section = self.config_section(config, Some("volumes"));
        for (host_dir, sandbox_dir) in config.items(&section) {
            let host_dir = expand_vars(&host_dir, &ctx.environ);
            let sandbox_dir = sandbox_dir.unwrap_or_else(|| host_dir.clone());
            volumes.insert(host_dir, sandbox_dir);
        }

        if let Some(task) = task {
            let task_volumes = task.sandbox_volumes(&volumes);
            volumes.update(&task_volumes);
        }

        volumes
    }

    /// Configured name of the staging subdirectory; an empty value disables that direction
    pub fn stage_dir_name(&self, config: &dyn ConfigLookup, kind: StageKind) -> Option<String> {
        let section = self.config_section(config, None);
        let name = config
            .get(&section, kind.dir_name_option())
            .unwrap_or_else(|| kind.default_dir_name().to_string());
        let name = name.trim().to_string();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }

    /// User and group ids the sandboxed process should run as
    pub fn user(&self, config: &dyn ConfigLookup) -> Result<(u32, u32)> {
        let (mut uid, mut gid) = current_user();
        let section = self.config_section(config, None);
        if let Some(v) = config.get_int(&section, "uid")? {
            uid = to_id(v, "uid")?;
        }
        if let Some(v) = config.get_int(&section, "gid")? {
            gid = to_id(v, "gid")?;
        }
        Ok((uid, gid))
    }

    /// Executable (split into words) that re-invokes the task inside the sandbox
    pub fn reentry_executable(
        &self,
        config: &dyn ConfigLookup,
        task: &dyn SandboxTask,
        ctx: &ExecutionContext,
    ) -> Vec<String> {
        let section = self.config_section(config, None);
        let executable = config
            .get(&section, "reentry_executable")
            .map(|e| expand_vars(&e, &ctx.environ))
            .unwrap_or_else(|| task.reentry_executable());
        split_words(&executable)
    }

    pub fn build_command(&self, proxy: &ProxyCommand) -> Result<String> {
        Ok(self.backend.build_command(proxy)?)
    }

    pub fn stage_mount(&self, kind: StageKind) -> Option<String> {
        self.backend.stage_mount(kind)
    }
}

/// `<type>_sandbox[_<postfix>]`, or its `_<name>` variant when the config defines it
pub fn config_section(
    sandbox_type: &str,
    name: &str,
    postfix: Option<&str>,
    config: &dyn ConfigLookup,
) -> String {
    let mut section = format!("{}_sandbox", sandbox_type);
    if let Some(postfix) = postfix {
        section.push('_');
        section.push_str(postfix);
    }
    let custom = format!("{}_{}", section, name);
    if config.has_section(&custom) {
        custom
    } else {
        section
    }
}

/// Run a command printing its environment with `env -0` and parse the result
pub(crate) async fn capture_env(mut cmd: tokio::process::Command) -> anyhow::Result<EnvMap> {
    let output = cmd
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .context("failed to spawn environment dump")?;
    if !output.status.success() {
        anyhow::bail!(
            "environment dump exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(parse_env_dump(&output.stdout))
}

/// Parse NUL separated `NAME=value` records as printed by `env -0`
pub(crate) fn parse_env_dump(raw: &[u8]) -> EnvMap {
    raw.split(|b| *b == 0)
        .filter(|record| !record.is_empty())
        .filter_map(|record| {
            let record = String::from_utf8_lossy(record);
            let (name, value) = record.split_once('=')?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

fn is_pattern(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

fn to_id(value: i64, option: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| SandboxError::configuration(format!("{} {} is out of range", option, value)))
}

#[cfg(unix)]
pub(crate) fn current_user() -> (u32, u32) {
    // SAFETY: getuid and getgid cannot fail and have no preconditions
    unsafe { (libc::getuid(), libc::getgid()) }
}

#[cfg(not(unix))]
pub(crate) fn current_user() -> (u32, u32) {
    (0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;

    struct NullBackend;

    #[async_trait]
    impl SandboxBackend for NullBackend {
        fn sandbox_type(&self) -> &str {
            "null"
        }

        fn env_cache_key(&self) -> String {
            "null".to_string()
        }

        async fn resolve_environment(&self) -> anyhow::Result<EnvMap> {
            Ok(EnvMap::new())
        }

        fn build_command(&self, proxy: &ProxyCommand) -> anyhow::Result<String> {
            Ok(proxy.to_shell())
        }
    }

    fn sandbox(name: &str) -> Sandbox {
        Sandbox::new(name, Box::new(NullBackend))
    }

    struct NoopTask;

    impl SandboxTask for NoopTask {
        fn task_id(&self) -> String {
            "Noop".to_string()
        }
        fn family(&self) -> String {
            "Noop".to_string()
        }
        fn sandbox(&self) -> String {
            "null::x".to_string()
        }
        fn inputs(&self, _env: &EnvMap) -> crate::staging::TargetStruct {
            crate::staging::TargetStruct::empty()
        }
        fn outputs(&self, _env: &EnvMap) -> crate::staging::TargetStruct {
            crate::staging::TargetStruct::empty()
        }
        fn run(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_config_section_prefers_named_variant() {
        let mut config = SandboxConfig::new();
        config.add_section("null_sandbox").add_section("null_sandbox_env_special");

        assert_eq!(sandbox("plain").config_section(&config, None), "null_sandbox");
        assert_eq!(
            sandbox("special").config_section(&config, Some("env")),
            "null_sandbox_env_special"
        );
        assert_eq!(
            sandbox("plain").config_section(&config, Some("env")),
            "null_sandbox_env"
        );
    }

    #[test]
    fn test_build_env_without_task() {
        let mut config = SandboxConfig::new();
        config
            .set("null_sandbox_env", "FIXED", Some("value"))
            .set("null_sandbox_env", "HOME", None)
            .set("null_sandbox_env", "LC_*", None);
        let ctx = ExecutionContext::from_vars([
            ("HOME", "/home/me"),
            ("LC_ALL", "C"),
            ("LC_TIME", "en_DK"),
            ("LANG", "C"),
        ])
        .unwrap();

        let env = sandbox("a$b").build_env(None, &ctx, &config);
        assert_eq!(env.get(ENV_SANDBOX), Some(r"null::a\$b"));
        assert_eq!(env.get(ENV_SANDBOX_SWITCHED), Some("1"));
        assert_eq!(env.get("FIXED"), Some("value"));
        assert_eq!(env.get("HOME"), Some("/home/me"));
        assert_eq!(env.get("LC_ALL"), Some("C"));
        assert_eq!(env.get("LC_TIME"), Some("en_DK"));
        assert!(!env.contains_key("LANG"));
        assert!(!env.contains_key(ENV_SANDBOX_TASK_ID));
    }

    #[test]
    fn test_parse_env_dump() {
        let env = parse_env_dump(b"PATH=/usr/bin\0MULTI=a\nb=c\0\0BROKEN\0");
        assert_eq!(env.get("PATH"), Some("/usr/bin"));
        assert_eq!(env.get("MULTI"), Some("a\nb=c"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_build_volumes_expands_host_paths() {
        let mut config = SandboxConfig::new();
        config.set("null_sandbox_volumes", "$DATA/in", Some("/in"));
        let ctx = ExecutionContext::from_vars([("DATA", "/srv/data")]).unwrap();

        let volumes = sandbox("x").build_volumes(None, &ctx, &config);
        assert_eq!(volumes.get("/srv/data/in"), Some("/in"));
    }

    #[test]
    fn test_stage_dir_names_and_user_overrides() {
        let mut config = SandboxConfig::new();
        config
            .set("null_sandbox", "stageout_dir_name", Some(""))
            .set("null_sandbox", "uid", Some("1234"));
        let sb = sandbox("x");

        assert_eq!(sb.stage_dir_name(&config, StageKind::In).as_deref(), Some("stagein"));
        assert_eq!(sb.stage_dir_name(&config, StageKind::Out), None);
        assert_eq!(sb.user(&config).unwrap().0, 1234);

        config.set("null_sandbox", "gid", Some("-1"));
        assert!(sb.user(&config).is_err());
    }

    #[test]
    fn test_reentry_executable_keeps_quoted_words() {
        let mut config = SandboxConfig::new();
        config.set(
            "null_sandbox",
            "reentry_executable",
            Some("'$TOOLS/my runner' --mode \"fast lane\""),
        );
        let ctx = ExecutionContext::from_vars([("TOOLS", "/opt/tools")]).unwrap();

        let words = sandbox("x").reentry_executable(&config, &NoopTask, &ctx);
        assert_eq!(words, vec!["/opt/tools/my runner", "--mode", "fast lane"]);

        let default = sandbox("x").reentry_executable(&SandboxConfig::new(), &NoopTask, &ctx);
        assert!(!default.is_empty());
    }
}
