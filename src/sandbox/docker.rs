use super::{capture_env, config_section, SandboxBackend, SandboxRegistry, StageKind};
use crate::config::ConfigLookup;
use crate::error::Result;
use crate::proxy::{shell_quote, ProxyCommand};
use crate::vars::EnvMap;
use async_trait::async_trait;
use tokio::process::Command;

pub const SANDBOX_TYPE: &str = "docker";

const STAGEIN_MOUNT: &str = "/sandtask/stagein";
const STAGEOUT_MOUNT: &str = "/sandtask/stageout";

/// Sandbox running the task in a throwaway container of an image.
///
/// The sandbox name is the image, e.g. `docker::python:3.12-slim`.
pub struct DockerSandbox {
    pub image: String,
    /// Container CLI, `docker` unless configured otherwise
    pub executable: String,
    /// Extra arguments passed to `run`, from the `run_args` option
    pub run_args: Vec<String>,
}

impl DockerSandbox {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
            executable: "docker".to_string(),
            run_args: Vec::new(),
        }
    }
}

pub fn register(registry: &SandboxRegistry) -> Result<()> {
    registry.register(SANDBOX_TYPE, construct)
}

fn construct(name: &str, config: &dyn ConfigLookup) -> anyhow::Result<Box<dyn SandboxBackend>> {
    let section = config_section(SANDBOX_TYPE, name, None, config);
    let mut sandbox = DockerSandbox::new(name);
    if let Some(executable) = config.get(&section, "executable") {
        sandbox.executable = executable;
    }
    if let Some(args) = config.get(&section, "run_args") {
        sandbox.run_args = args.split_whitespace().map(str::to_string).collect();
    }
    Ok(Box::new(sandbox))
}

#[async_trait]
impl SandboxBackend for DockerSandbox {
    fn sandbox_type(&self) -> &str {
        SANDBOX_TYPE
    }

    fn env_cache_key(&self) -> String {
        self.image.clone()
    }

    async fn resolve_environment(&self) -> anyhow::Result<EnvMap> {
        tracing::info!(image = %self.image, "resolving container environment");
        let mut cmd = Command::new(&self.executable);
        cmd.args(["run", "--rm", "--entrypoint", "env", &self.image, "-0"]);
        capture_env(cmd).await
    }

    fn build_command(&self, proxy: &ProxyCommand) -> anyhow::Result<String> {
        let mut args = vec![self.executable.clone(), "run".to_string(), "--rm".to_string()];
        args.extend(self.run_args.iter().cloned());
        for (host_dir, container_dir) in proxy.volumes.iter() {
            args.push("-v".to_string());
            args.push(format!("{}:{}", host_dir, container_dir));
        }
        if let Some((uid, gid)) = proxy.user {
            args.push("-u".to_string());
            args.push(format!("{}:{}", uid, gid));
        }
        args.push(self.image.clone());

        let mut inner = proxy.export_cmds();
        inner.extend(proxy.setup_cmds.iter().cloned());
        inner.push(proxy.to_shell());

        let mut cmd = args.iter().map(|a| shell_quote(a)).collect::<Vec<_>>();
        cmd.push("bash".to_string());
        cmd.push("-c".to_string());
        cmd.push(shell_quote(&inner.join(" && ")));
        Ok(cmd.join(" "))
    }

    fn stage_mount(&self, kind: StageKind) -> Option<String> {
        Some(match kind {
            StageKind::In => STAGEIN_MOUNT,
            StageKind::Out => STAGEOUT_MOUNT,
        }
        .to_string())
    }
}
