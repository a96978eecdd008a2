use serde::Deserialize;
use std::path::PathBuf;

use chrono::Duration;

use crate::capability::audit::DEFAULT_RETAINED_ENTRIES;
use crate::capability::cache::DEFAULT_CACHE_SIZE;
use crate::capability::{GrantOptions, Restrictions};
use crate::sandbox::SandboxConfig;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    /// Grants placed on the root context of every session
    #[serde(default)]
    pub capabilities: Vec<CapabilityGrant>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Provenance stamped on configured grants
    #[serde(default = "default_granted_by")]
    pub granted_by: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            granted_by: default_granted_by(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_size")]
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    /// JSONL file receiving every audit entry. In-memory only when unset.
    /// Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Entries kept in memory while `path` is set
    #[serde(default = "default_retain_entries")]
    pub retain_entries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            retain_entries: default_retain_entries(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CapabilityGrant {
    /// Qualified capability string, e.g. "file.read:/data/**"
    pub capability: String,
    #[serde(default)]
    pub expires_in_secs: Option<u64>,
    #[serde(default)]
    pub restrictions: Restrictions,
}

/// Longer expiries are clamped to this (100 years).
const MAX_EXPIRY_SECS: u64 = 100 * 365 * 24 * 3600;

fn default_granted_by() -> String {
    "config".to_string()
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

fn default_retain_entries() -> usize {
    DEFAULT_RETAINED_ENTRIES
}

impl CapabilityGrant {
    /// Grant options for this entry, expiry counted from now.
    pub fn options(&self, granted_by: &str) -> GrantOptions {
        let mut options = GrantOptions::new().granted_by(granted_by);
        options.restrictions = self.restrictions.clone();
        if let Some(secs) = self.expires_in_secs {
            let secs = secs.min(MAX_EXPIRY_SECS) as i64;
            options = options.expires_in(Duration::seconds(secs));
        }
        options
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses TOML after expanding environment variables like ${DATA_DIR}
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── parse tests ─────────────────────────────────────

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.session.granted_by, "config");
        assert_eq!(config.cache.max_size, 1024);
        assert!(config.audit.path.is_none());
        assert_eq!(config.audit.retain_entries, DEFAULT_RETAINED_ENTRIES);
        assert!(config.capabilities.is_empty());
        assert_eq!(config.sandbox.max_wall_time_seconds, 60);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
[session]
granted_by = "ops"

[sandbox]
max_wall_time_seconds = 5
allow_network = true
interpreter = "sh"
interpreter_args = []
script_extension = "sh"

[sandbox.environment_vars]
APP_MODE = "test"

[cache]
max_size = 16

[audit]
path = "./data/audit.jsonl"
retain_entries = 500

[[capabilities]]
capability = "file.read:/data/**"
expires_in_secs = 3600

[capabilities.restrictions]
max_bytes = 1048576

[[capabilities]]
capability = "network.https:*.example.com"
"#,
        )
        .unwrap();

        assert_eq!(config.session.granted_by, "ops");
        assert_eq!(config.sandbox.max_wall_time_seconds, 5);
        assert!(config.sandbox.interpreter_args.is_empty());
        assert_eq!(config.sandbox.environment_vars["APP_MODE"], "test");
        assert_eq!(config.cache.max_size, 16);
        assert_eq!(
            config.audit.path,
            Some(PathBuf::from("./data/audit.jsonl"))
        );
        assert_eq!(config.audit.retain_entries, 500);
        assert_eq!(config.capabilities.len(), 2);
        assert_eq!(config.capabilities[0].expires_in_secs, Some(3600));
        assert_eq!(
            config.capabilities[0].restrictions.get("max_bytes"),
            Some(&json!(1048576))
        );
        assert!(config.capabilities[1].restrictions.is_empty());
    }

    #[test]
    fn test_capability_entry_requires_capability() {
        let result = Config::parse(
            r#"
[[capabilities]]
expires_in_secs = 10
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("CAPGUARD_TEST_AUDIT_DIR", "/var/log/capguard");
        let config = Config::parse(
            r#"
[audit]
path = "${CAPGUARD_TEST_AUDIT_DIR}/audit.jsonl"
"#,
        )
        .unwrap();
        assert_eq!(
            config.audit.path,
            Some(PathBuf::from("/var/log/capguard/audit.jsonl"))
        );
    }

    #[test]
    fn test_undefined_env_var_is_an_error() {
        let result = Config::parse(
            r#"
[audit]
path = "${CAPGUARD_TEST_SURELY_UNDEFINED}/audit.jsonl"
"#,
        );
        assert!(result.is_err());
    }

    // ── grant options tests ─────────────────────────────

    #[test]
    fn test_grant_options() {
        let grant = CapabilityGrant {
            capability: "file.read:/data/**".to_string(),
            expires_in_secs: Some(60),
            restrictions: Restrictions::new().with("max_bytes", json!(10)),
        };
        let options = grant.options("ops");
        assert_eq!(options.granted_by.as_deref(), Some("ops"));
        assert!(options.expires_at.is_some());
        assert_eq!(options.restrictions.numeric("max_bytes"), Some(10.0));

        let forever = CapabilityGrant {
            expires_in_secs: None,
            ..grant
        };
        assert!(forever.options("ops").expires_at.is_none());
    }
}
