use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandtask::logging::init_logging;
use sandtask::{EnvironmentCache, ExecutionContext, Sandbox, SandboxConfig, SandboxRegistry};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "Inspect sandboxes used for task execution", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "SANDTASK_JSON_LOGS")]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the ambient execution context as JSON
    Context,
    /// Resolve a sandbox and print its environment as JSON
    Env {
        /// Sandbox key, e.g. bash::/opt/setup.sh
        #[arg(long)]
        key: String,
        /// JSON file with sandbox config sections
        #[arg(long, env = "SANDTASK_CONFIG")]
        config: Option<PathBuf>,
    },
    /// List the registered sandbox types
    Types,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs).map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    match cli.command {
        Commands::Context => {
            let ctx = ExecutionContext::from_env()?;
            println!("{}", serde_json::to_string_pretty(&ctx)?);
        }
        Commands::Env { key, config } => {
            let config = match config {
                Some(path) => SandboxConfig::from_file(&path)
                    .with_context(|| format!("failed to load config from {}", path.display()))?,
                None => SandboxConfig::new(),
            };
            let sandbox: Sandbox = SandboxRegistry::global().resolve(&key, &config)?;
            let env = sandbox.environment(&EnvironmentCache::global()).await?;
            println!("{}", serde_json::to_string_pretty(env.as_ref())?);
        }
        Commands::Types => {
            for sandbox_type in SandboxRegistry::global().registered_types() {
                println!("{}", sandbox_type);
            }
        }
    }

    Ok(())
}
