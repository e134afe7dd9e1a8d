use super::{capture_env, SandboxBackend, SandboxRegistry};
use crate::config::ConfigLookup;
use crate::constants::SANDBOX_SHELL;
use crate::error::Result;
use crate::proxy::{shell_quote, ProxyCommand};
use crate::vars::EnvMap;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;

pub const SANDBOX_TYPE: &str = "bash";

/// Sandbox given by a bash setup script that is sourced before the task runs.
///
/// The sandbox name is the path of the script, e.g. `bash::/opt/sw/setup.sh`.
pub struct BashSandbox {
    pub script: PathBuf,
}

impl BashSandbox {
    pub fn new(script: PathBuf) -> Self {
        Self { script }
    }

    fn source_cmd(&self) -> String {
        format!("source {} \"\"", shell_quote(&self.script.to_string_lossy()))
    }
}

pub fn register(registry: &SandboxRegistry) -> Result<()> {
    registry.register(SANDBOX_TYPE, construct)
}

fn construct(name: &str, _config: &dyn ConfigLookup) -> anyhow::Result<Box<dyn SandboxBackend>> {
    let script = PathBuf::from(name);
    let script = if script.is_absolute() {
        script
    } else {
        std::env::current_dir()?.join(script)
    };
    Ok(Box::new(BashSandbox::new(script)))
}

#[async_trait]
impl SandboxBackend for BashSandbox {
    fn sandbox_type(&self) -> &str {
        SANDBOX_TYPE
    }

    fn env_cache_key(&self) -> String {
        self.script.to_string_lossy().into_owned()
    }

    async fn resolve_environment(&self) -> anyhow::Result<EnvMap> {
        let mut cmd = Command::new(SANDBOX_SHELL);
        cmd.arg("-c")
            .arg(format!("{} > /dev/null && env -0", self.source_cmd()));
        capture_env(cmd).await
    }

    fn build_command(&self, proxy: &ProxyCommand) -> anyhow::Result<String> {
        let mut cmds = vec![self.source_cmd()];
        cmds.extend(proxy.export_cmds());
        cmds.extend(proxy.setup_cmds.iter().cloned());
        cmds.push(proxy.to_shell());
        Ok(cmds.join(" && "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_build_command_sources_script_first() {
        let sandbox = BashSandbox::new(PathBuf::from("/opt/my env/setup.sh"));
        let mut proxy = ProxyCommand {
            executable: vec!["sandtask".to_string()],
            task_family: "Plot".to_string(),
            setup_cmds: vec!["cd /work".to_string()],
            ..Default::default()
        };
        proxy.env.insert("SANDTASK_SANDBOX_SWITCHED", "1");

        let cmd = sandbox.build_command(&proxy).unwrap();
        assert_eq!(
            cmd,
            "source '/opt/my env/setup.sh' \"\" && export SANDTASK_SANDBOX_SWITCHED=\"1\" && cd /work && sandtask run Plot"
        );
    }

    #[test]
    fn test_relative_script_is_made_absolute() {
        let backend = construct("setup.sh", &SandboxConfig::new()).unwrap();
        assert!(PathBuf::from(backend.env_cache_key()).is_absolute());
        assert_eq!(backend.sandbox_type(), "bash");
    }

    #[tokio::test]
    async fn test_resolve_environment_sources_script() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("setup.sh");
        fs::write(&script, "export SANDTASK_TEST_VALUE=\"from setup\"\necho noise\n").unwrap();

        let env = BashSandbox::new(script).resolve_environment().await.unwrap();
        assert_eq!(env.get("SANDTASK_TEST_VALUE"), Some("from setup"));
    }

    #[tokio::test]
    async fn test_failing_script_is_an_error() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("broken.sh");
        fs::write(&script, "return 3\n").unwrap();

        assert!(BashSandbox::new(script).resolve_environment().await.is_err());
    }
}
