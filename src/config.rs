use crate::error::{Result, SandboxError};
use crate::vars::EnvMap;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

/// Key-value configuration service consumed by the sandbox engine.
///
/// Sections are flat lists of options. An option without a value (`None`) is
/// meaningful in env sections, where it means "take the value from the
/// ambient environment".
pub trait ConfigLookup: Send + Sync {
    fn has_section(&self, section: &str) -> bool;

    /// All options of a section in their defined order; empty if the section is missing
    fn items(&self, section: &str) -> Vec<(String, Option<String>)>;

    fn get(&self, section: &str, option: &str) -> Option<String> {
        self.items(section)
            .into_iter()
            .find(|(k, _)| k == option)
            .and_then(|(_, v)| v)
    }

    fn get_int(&self, section: &str, option: &str) -> Result<Option<i64>> {
        match self.get(section, option) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<i64>().map(Some).map_err(|_| {
                SandboxError::configuration(format!(
                    "option '{}' in section '{}' is not an integer: '{}'",
                    option, section, raw
                ))
            }),
        }
    }
}

/// In-memory configuration, typically loaded from a JSON document of the form
/// `{"docker_sandbox": {"uid": "1000"}, "docker_sandbox_env": {"PATH": null}}`.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfig {
    sections: BTreeMap<String, Vec<(String, Option<String>)>>,
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| SandboxError::configuration(format!("invalid config json: {}", e)))?;
        let root = value
            .as_object()
            .ok_or_else(|| SandboxError::configuration("config root must be an object"))?;

        let mut config = Self::new();
        for (section, options) in root {
            let options = options.as_object().ok_or_else(|| {
                SandboxError::configuration(format!("section '{}' must be an object", section))
            })?;
            let entries = config.sections.entry(section.clone()).or_default();
            for (option, value) in options {
                let value = match value {
                    serde_json::Value::Null => None,
                    serde_json::Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                };
                entries.push((option.clone(), value));
            }
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Set an option, creating the section when needed
    pub fn set(&mut self, section: &str, option: &str, value: Option<&str>) -> &mut Self {
        let entries = self.sections.entry(section.to_string()).or_default();
        let value = value.map(str::to_string);
        match entries.iter_mut().find(|(k, _)| k == option) {
            Some(entry) => entry.1 = value,
            None => entries.push((option.to_string(), value)),
        }
        self
    }

    pub fn add_section(&mut self, section: &str) -> &mut Self {
        self.sections.entry(section.to_string()).or_default();
        self
    }
}

impl ConfigLookup for SandboxConfig {
    fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    fn items(&self, section: &str) -> Vec<(String, Option<String>)> {
        self.sections.get(section).cloned().unwrap_or_default()
    }
}

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
            .expect("variable pattern is valid")
    })
}

/// Expand a leading `~` and `$VAR` / `${VAR}` references against `env`.
///
/// Unknown variables are left untouched.
pub fn expand_vars(value: &str, env: &EnvMap) -> String {
    let value = match (value.strip_prefix('~'), env.get("HOME")) {
        (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
            format!("{}{}", home, rest)
        }
        _ => value.to_string(),
    };

    var_pattern()
        .replace_all(&value, |caps: &regex::Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match env.get(name) {
                Some(v) => v.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_sections_and_null_values() {
        let config = SandboxConfig::from_json_str(
            r#"{"bash_sandbox": {"uid": 1000, "stagein_dir_name": "in"},
                "bash_sandbox_env": {"PATH": null, "FOO": "bar"}}"#,
        )
        .unwrap();

        assert!(config.has_section("bash_sandbox"));
        assert!(!config.has_section("docker_sandbox"));
        assert_eq!(config.get_int("bash_sandbox", "uid").unwrap(), Some(1000));
        assert_eq!(config.get("bash_sandbox", "stagein_dir_name").as_deref(), Some("in"));

        let env_items = config.items("bash_sandbox_env");
        assert!(env_items.contains(&("PATH".to_string(), None)));
        assert!(env_items.contains(&("FOO".to_string(), Some("bar".to_string()))));
    }

    #[test]
    fn test_json_options_keep_written_order() {
        let config = SandboxConfig::from_json_str(
            r#"{"bash_sandbox_env": {"Z_ROOT": "/opt", "A_BIN": "$Z_ROOT/bin", "M_*": null}}"#,
        )
        .unwrap();

        let names: Vec<_> = config
            .items("bash_sandbox_env")
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(names, vec!["Z_ROOT", "A_BIN", "M_*"]);
    }

    #[test]
    fn test_invalid_int_is_configuration_error() {
        let mut config = SandboxConfig::new();
        config.set("docker_sandbox", "gid", Some("staff"));
        assert!(matches!(
            config.get_int("docker_sandbox", "gid"),
            Err(SandboxError::Configuration { .. })
        ));
    }

    #[test]
    fn test_expand_vars() {
        let env: EnvMap = [("HOME", "/home/me"), ("DATA", "/data")].into_iter().collect();
        assert_eq!(expand_vars("~/x", &env), "/home/me/x");
        assert_eq!(expand_vars("$DATA/in", &env), "/data/in");
        assert_eq!(expand_vars("${DATA}_out", &env), "/data_out");
        assert_eq!(expand_vars("$MISSING/y", &env), "$MISSING/y");
        assert_eq!(expand_vars("~user/z", &env), "~user/z");
    }
}
