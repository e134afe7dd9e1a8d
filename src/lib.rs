pub mod cache;
pub mod config;
pub mod constants;
pub mod context;
pub mod controller;
pub mod error;
pub mod executor;
pub mod logging;
pub mod proxy;
pub mod sandbox;
pub mod staging;
pub mod task;
pub mod vars;

pub use cache::EnvironmentCache;
pub use config::{ConfigLookup, SandboxConfig};
pub use context::ExecutionContext;
pub use controller::{ControllerState, RunOutcome, SandboxController};
pub use error::{Result, SandboxError};
pub use executor::{ExecutorState, ProxyExecutor, RunReport};
pub use sandbox::{Sandbox, SandboxBackend, SandboxKey, SandboxRegistry, StageKind};
pub use staging::{StageInfo, StageMask, Target, TargetStruct};
pub use task::SandboxTask;
pub use vars::{EnvMap, VolumeMap};
