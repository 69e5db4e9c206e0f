//! Sandbox configuration loaded from JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::{Policy, get_policy};

/// Names the policy explicitly.
pub const POLICY_ENV_VAR: &str = "SLUICE_SANDBOX_POLICY";

/// Set to `false` to fall back to the permissive policy when
/// [`POLICY_ENV_VAR`] is unset.
pub const SANDBOXED_ENV_VAR: &str = "SLUICE_SANDBOXED";

/// Errors from loading a [`SandboxConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not a valid configuration.
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How skills are run.
///
/// ```json
/// {
///   "policy": "restrictive",
///   "allow_modules": ["mylib"],
///   "deny_modules": ["json"],
///   "env_allowlist": ["SKILL_REGION"],
///   "deny_underscore_attributes": true,
///   "timeout": 5000
/// }
/// ```
///
/// Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Policy name; see [`get_policy`]. Read from the process environment
    /// when absent.
    pub policy: Option<String>,
    /// Modules allowed on top of the restrictive defaults.
    pub allow_modules: Vec<String>,
    /// Modules denied by the restrictive policy.
    pub deny_modules: Vec<String>,
    /// Extra environment keys visible under the permissive policy.
    pub env_allowlist: Vec<String>,
    /// Reject `_`-prefixed names in restrictive mode.
    pub deny_underscore_attributes: bool,
    /// Wall-clock deadline the caller should enforce around a run.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            policy: None,
            allow_modules: Vec::new(),
            deny_modules: Vec::new(),
            env_allowlist: Vec::new(),
            deny_underscore_attributes: true,
            timeout: Duration::from_secs(30),
        }
    }
}

impl SandboxConfig {
    /// Load a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded sandbox config");
        Ok(config)
    }

    /// The policy name the process environment asks for.
    pub fn policy_name_from_env() -> String {
        policy_name_from(|key| std::env::var(key).ok())
    }

    /// Build the configured policy.
    pub fn build_policy(&self, parent: &tracing::Span) -> Policy {
        let name = match &self.policy {
            Some(name) => name.clone(),
            None => Self::policy_name_from_env(),
        };
        let mut policy = get_policy(Some(&name), parent);
        match &mut policy {
            Policy::Restrictive(p) => {
                p.allow_modules(self.allow_modules.iter().cloned());
                p.deny_modules(self.deny_modules.iter().cloned());
                p.set_deny_underscore_attributes(self.deny_underscore_attributes);
            }
            Policy::Unrestricted(p) => {
                for key in &self.env_allowlist {
                    p.allow_env_var(key.clone());
                }
            }
        }
        policy
    }
}

fn policy_name_from(lookup: impl Fn(&str) -> Option<String>) -> String {
    if let Some(name) = lookup(POLICY_ENV_VAR) {
        return name;
    }
    match lookup(SANDBOXED_ENV_VAR) {
        Some(flag) if flag.eq_ignore_ascii_case("false") => "permissive".to_string(),
        _ => "restrictive".to_string(),
    }
}

/// Helper for serializing Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;
    use crate::scoped_env::EnvScope;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config: SandboxConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SandboxConfig::default());
        assert!(config.deny_underscore_attributes);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_timeout_is_milliseconds() {
        let config: SandboxConfig = serde_json::from_str(r#"{"timeout": 1500}"#).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["timeout"], 1500);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"policy": "restrictive", "deny_modules": ["json"], "deny_underscore_attributes": false}}"#
        )
        .unwrap();
        let config = SandboxConfig::from_file(file.path()).unwrap();
        assert_eq!(config.policy.as_deref(), Some("restrictive"));
        assert_eq!(config.deny_modules, ["json"]);
        assert!(!config.deny_underscore_attributes);
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = SandboxConfig::from_file(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io(_)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"timeout": "soon"}}"#).unwrap();
        let invalid = SandboxConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(invalid, ConfigError::Parse(_)));
    }

    #[test]
    fn test_policy_name_lookup() {
        assert_eq!(policy_name_from(lookup(&[])), "restrictive");
        assert_eq!(policy_name_from(lookup(&[(SANDBOXED_ENV_VAR, "False")])), "permissive");
        assert_eq!(policy_name_from(lookup(&[(SANDBOXED_ENV_VAR, "true")])), "restrictive");
        assert_eq!(
            policy_name_from(lookup(&[(POLICY_ENV_VAR, "none"), (SANDBOXED_ENV_VAR, "false")])),
            "none"
        );
    }

    #[test]
    fn test_build_restrictive() {
        let config = SandboxConfig {
            policy: Some("restrictive".to_string()),
            allow_modules: vec!["mylib".to_string()],
            deny_modules: vec!["json".to_string()],
            ..SandboxConfig::default()
        };
        let Policy::Restrictive(p) = config.build_policy(&tracing::Span::none()) else {
            panic!("expected restrictive");
        };
        assert!(p.modules().allows("mylib"));
        assert!(p.modules().denies("json"));
        assert!(p.modules().allows("math"));
    }

    #[test]
    fn test_build_permissive_extends_env_allowlist() {
        let config = SandboxConfig {
            policy: Some("permissive".to_string()),
            env_allowlist: vec!["SKILL_REGION".to_string()],
            ..SandboxConfig::default()
        };
        let Policy::Unrestricted(p) = config.build_policy(&tracing::Span::none()) else {
            panic!("expected unrestricted");
        };
        let EnvScope::AllowList(keys) = p.env_scope() else {
            panic!("expected an allow-list");
        };
        assert!(keys.contains(&"SKILL_REGION".to_string()));
        assert!(keys.contains(&"PATH".to_string()));
    }
}
