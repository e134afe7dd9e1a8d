use crate::constants::{SANDBOX_KEY_DELIMITER, SANDBOX_LIST_SEPARATOR};
use crate::error::{Result, SandboxError};
use std::fmt;
use std::str::FromStr;

/// A validated `type::name` sandbox designation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxKey {
    sandbox_type: String,
    name: String,
}

impl SandboxKey {
    pub fn new(sandbox_type: &str, name: &str) -> Result<Self> {
        Self::parse(&join(sandbox_type, name))
    }

    pub fn parse(key: &str) -> Result<Self> {
        let (sandbox_type, name) = split(key)?;
        Ok(Self { sandbox_type, name })
    }

    pub fn sandbox_type(&self) -> &str {
        &self.sandbox_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for SandboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.sandbox_type, SANDBOX_KEY_DELIMITER, self.name)
    }
}

impl FromStr for SandboxKey {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Commas separate multiple keys in the ambient sandbox list, so no single key may contain one
pub fn check(key: &str) -> Result<()> {
    if key.contains(SANDBOX_LIST_SEPARATOR) {
        return Err(SandboxError::format(key, "sandbox keys must not contain commas"));
    }
    Ok(())
}

/// Full validation: no commas and exactly two non-blank parts
pub fn validate(key: &str) -> Result<()> {
    split(key).map(|_| ())
}

/// Split a key into its type and name on the first delimiter
pub fn split(key: &str) -> Result<(String, String)> {
    check(key)?;
    match key.split_once(SANDBOX_KEY_DELIMITER) {
        Some((t, n)) if !t.trim().is_empty() && !n.trim().is_empty() => {
            Ok((t.to_string(), n.to_string()))
        }
        _ => Err(SandboxError::format(
            key,
            format!("expected 'type{}name'", SANDBOX_KEY_DELIMITER),
        )),
    }
}

pub fn join(sandbox_type: &str, name: &str) -> String {
    format!("{}{}{}", sandbox_type, SANDBOX_KEY_DELIMITER, name)
}

/// Strip a leading `type::` if present
pub fn remove_type(key: &str) -> Result<String> {
    check(key)?;
    Ok(match key.split_once(SANDBOX_KEY_DELIMITER) {
        Some((_, name)) => name.to_string(),
        None => key.to_string(),
    })
}
