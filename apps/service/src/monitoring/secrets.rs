use serde_json::Value;

use super::types::Params;

const ENV_PREFIX: &str = "env:";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret reference '{0}' names no variable")]
    EmptyName(String),
    #[error("environment variable {0} is not set")]
    Missing(String),
}

/// Resolve an `env:NAME` reference; plain values pass through unchanged.
///
/// Resolved values are handed straight to the checker and must never reach a
/// log line, an outcome detail or an event.
pub fn resolve(value: &str) -> Result<String, SecretError> {
    resolve_with(value, |name| std::env::var(name).ok())
}

fn resolve_with(value: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String, SecretError> {
    let Some(name) = value.strip_prefix(ENV_PREFIX) else {
        return Ok(value.to_string());
    };

    let name = name.trim();
    if name.is_empty() {
        return Err(SecretError::EmptyName(value.to_string()));
    }
    lookup(name).ok_or_else(|| SecretError::Missing(name.to_string()))
}

/// String parameter lookup with secret resolution. Non-string values yield `None`.
pub fn param(params: &Params, key: &str) -> Result<Option<String>, SecretError> {
    match params.get(key) {
        Some(Value::String(raw)) => resolve(raw).map(Some),
        _ => Ok(None),
    }
}

/// Whether a raw parameter value is a secret reference rather than a literal
pub fn is_reference(value: &str) -> bool {
    value.starts_with(ENV_PREFIX)
}
