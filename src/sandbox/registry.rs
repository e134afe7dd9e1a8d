use super::{key, Sandbox, SandboxBackend};
use crate::config::ConfigLookup;
use crate::error::{Result, SandboxError};
use parking_lot::RwLock;
use std::sync::OnceLock;

/// Factory creating a backend for a sandbox name
pub type BackendConstructor =
    fn(name: &str, config: &dyn ConfigLookup) -> anyhow::Result<Box<dyn SandboxBackend>>;

/// Table mapping sandbox type tags to backend constructors.
///
/// Lookup is by exact tag equality. A backend that specializes another one
/// registers under its own tag; registering a tag twice is rejected.
#[derive(Default)]
pub struct SandboxRegistry {
    backends: RwLock<Vec<(String, BackendConstructor)>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend shipped in this crate
    pub fn with_builtin_backends() -> Self {
        let registry = Self::new();
        super::bash::register(&registry).expect("builtin backend tags are unique");
        super::docker::register(&registry).expect("builtin backend tags are unique");
        registry
    }

    /// Process-wide registry, populated with the builtin backends on first use
    pub fn global() -> &'static SandboxRegistry {
        static GLOBAL: OnceLock<SandboxRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::with_builtin_backends)
    }

    pub fn register(&self, sandbox_type: &str, constructor: BackendConstructor) -> Result<()> {
        if sandbox_type.trim().is_empty()
            || sandbox_type.contains(crate::constants::SANDBOX_KEY_DELIMITER)
        {
            return Err(SandboxError::format(sandbox_type, "invalid sandbox type tag"));
        }
        key::check(sandbox_type)?;

        let mut backends = self.backends.write();
        if backends.iter().any(|(tag, _)| tag == sandbox_type) {
            return Err(SandboxError::DuplicateSandboxType {
                sandbox_type: sandbox_type.to_string(),
            });
        }
        backends.push((sandbox_type.to_string(), constructor));
        tracing::debug!(sandbox_type, "registered sandbox backend");
        Ok(())
    }

    pub fn is_registered(&self, sandbox_type: &str) -> bool {
        self.backends.read().iter().any(|(tag, _)| tag == sandbox_type)
    }

    /// Registered type tags in registration order
    pub fn registered_types(&self) -> Vec<String> {
        self.backends.read().iter().map(|(tag, _)| tag.clone()).collect()
    }

    /// Validate `key`, find its backend and instantiate it for the key's name
    pub fn resolve(&self, key: &str, config: &dyn ConfigLookup) -> Result<Sandbox> {
        let (sandbox_type, name) = key::split(key)?;

        let constructor = self
            .backends
            .read()
            .iter()
            .find(|(tag, _)| *tag == sandbox_type)
            .map(|(_, ctor)| *ctor)
            .ok_or_else(|| SandboxError::UnknownSandboxType {
                sandbox_type: sandbox_type.clone(),
            })?;

        let backend = constructor(&name, config)?;
        Ok(Sandbox::new(&name, backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::proxy::ProxyCommand;
    use crate::vars::EnvMap;
    use async_trait::async_trait;

    struct EchoBackend {
        name: String,
    }

    #[async_trait]
    impl SandboxBackend for EchoBackend {
        fn sandbox_type(&self) -> &str {
            "echo"
        }

        fn env_cache_key(&self) -> String {
            self.name.clone()
        }

        async fn resolve_environment(&self) -> anyhow::Result<EnvMap> {
            Ok(EnvMap::new())
        }

        fn build_command(&self, proxy: &ProxyCommand) -> anyhow::Result<String> {
            Ok(format!("echo {}", proxy.to_shell()))
        }
    }

    fn echo_ctor(name: &str, _config: &dyn ConfigLookup) -> anyhow::Result<Box<dyn SandboxBackend>> {
        Ok(Box::new(EchoBackend {
            name: name.to_string(),
        }))
    }

    #[test]
    fn test_unknown_type() {
        let registry = SandboxRegistry::new();
        let err = registry
            .resolve("docker::default", &SandboxConfig::new())
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnknownSandboxType { sandbox_type } if sandbox_type == "docker"));
    }

    #[test]
    fn test_resolve_registered_backend() {
        let registry = SandboxRegistry::new();
        registry.register("echo", echo_ctor).unwrap();

        let sandbox = registry.resolve("echo::hello", &SandboxConfig::new()).unwrap();
        assert_eq!(sandbox.key(), "echo::hello");
        assert_eq!(sandbox.env_cache_key(), "hello");
        assert!(sandbox.stagein_info.is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = SandboxRegistry::new();
        registry.register("echo", echo_ctor).unwrap();
        assert!(matches!(
            registry.register("echo", echo_ctor),
            Err(SandboxError::DuplicateSandboxType { .. })
        ));
        assert_eq!(registry.registered_types(), vec!["echo".to_string()]);
    }

    #[test]
    fn test_invalid_tags_and_keys() {
        let registry = SandboxRegistry::new();
        assert!(registry.register("a::b", echo_ctor).is_err());
        assert!(registry.register("a,b", echo_ctor).is_err());
        assert!(registry.register(" ", echo_ctor).is_err());

        registry.register("echo", echo_ctor).unwrap();
        assert!(matches!(
            registry.resolve("echo::a,b", &SandboxConfig::new()),
            Err(SandboxError::Format { .. })
        ));
    }

    #[test]
    fn test_global_has_builtin_backends() {
        let registry = SandboxRegistry::global();
        assert!(registry.is_registered("bash"));
        assert!(registry.is_registered("docker"));
    }
}
