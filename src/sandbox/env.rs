//! Environment handed to the guest process.
//!
//! The subprocess starts from an empty environment. The only variables it
//! sees are the ones named by [`ReservedVar`] (set by the executor) plus
//! user-supplied entries that pass [`is_safe_entry`].

use std::path::Path;

use super::config::SandboxConfig;

/// Fixed `PATH` for guest processes.
pub const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

const MAX_VALUE_LEN: usize = 4096;

/// Prefixes that alter how the dynamic loader or interpreter behaves.
const LOADER_PREFIXES: &[&str] = &["LD_", "DYLD_", "PYTHON", "CAPGUARD_"];

const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '<', '>', '(', ')', '{', '}', '\\', '\'', '"', '*', '?', '!', '~',
];

/// Variables the executor itself controls. User entries may never set these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReservedVar {
    Path,
    PythonPath,
    TmpDir,
    Home,
    CapabilityToken,
    AllowedImports,
    AllowNetwork,
}

impl ReservedVar {
    pub const ALL: [ReservedVar; 7] = [
        ReservedVar::Path,
        ReservedVar::PythonPath,
        ReservedVar::TmpDir,
        ReservedVar::Home,
        ReservedVar::CapabilityToken,
        ReservedVar::AllowedImports,
        ReservedVar::AllowNetwork,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ReservedVar::Path => "PATH",
            ReservedVar::PythonPath => "PYTHONPATH",
            ReservedVar::TmpDir => "TMPDIR",
            ReservedVar::Home => "HOME",
            ReservedVar::CapabilityToken => "CAPGUARD_CAPABILITY_TOKEN",
            ReservedVar::AllowedImports => "CAPGUARD_ALLOWED_IMPORTS",
            ReservedVar::AllowNetwork => "CAPGUARD_ALLOW_NETWORK",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|var| var.name() == name)
    }
}

/// May `key=value` from `environment_vars` be forwarded?
///
/// Keys are `[A-Za-z_][A-Za-z0-9_]*`, not reserved and not a loader or
/// interpreter control variable. Values are bounded, free of control
/// characters and free of shell metacharacters.
pub fn is_safe_entry(key: &str, value: &str) -> bool {
    let mut chars = key.chars();
    let key_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !key_ok || ReservedVar::from_name(key).is_some() {
        return false;
    }
    let upper = key.to_ascii_uppercase();
    if LOADER_PREFIXES.iter().any(|p| upper.starts_with(p)) {
        return false;
    }

    value.len() <= MAX_VALUE_LEN
        && !value.chars().any(|c| c.is_control() || SHELL_METACHARACTERS.contains(&c))
}

/// The complete variable set for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxEnvironment {
    vars: Vec<(String, String)>,
    rejected: Vec<String>,
}

impl SandboxEnvironment {
    /// Reserved variables first, then the filtered user entries in key order.
    pub fn build(config: &SandboxConfig, work_dir: &Path, capability_token: &str) -> Self {
        let dir = work_dir.to_string_lossy().into_owned();
        let imports = config
            .allowed_imports
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let network = if config.allow_network { "1" } else { "0" };

        let mut vars: Vec<(String, String)> = ReservedVar::ALL
            .into_iter()
            .map(|var| {
                let value = match var {
                    ReservedVar::Path => SAFE_PATH.to_string(),
                    ReservedVar::PythonPath | ReservedVar::TmpDir | ReservedVar::Home => {
                        dir.clone()
                    }
                    ReservedVar::CapabilityToken => capability_token.to_string(),
                    ReservedVar::AllowedImports => imports.clone(),
                    ReservedVar::AllowNetwork => network.to_string(),
                };
                (var.name().to_string(), value)
            })
            .collect();

        let mut rejected = Vec::new();
        for (key, value) in &config.environment_vars {
            if is_safe_entry(key, value) {
                vars.push((key.clone(), value.clone()));
            } else {
                rejected.push(key.clone());
            }
        }

        Self { vars, rejected }
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Keys from `environment_vars` that failed the safety filter.
    pub fn rejected(&self) -> &[String] {
        &self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_names_round_trip() {
        for var in ReservedVar::ALL {
            assert_eq!(ReservedVar::from_name(var.name()), Some(var));
        }
        assert_eq!(ReservedVar::from_name("USER"), None);
    }

    #[test]
    fn test_safe_entries() {
        assert!(is_safe_entry("APP_MODE", "test"));
        assert!(is_safe_entry("_private", "a-b.c/d:e=f"));
        assert!(is_safe_entry("EMPTY", ""));
    }

    #[test]
    fn test_unsafe_keys() {
        assert!(!is_safe_entry("PATH", "/tmp"));
        assert!(!is_safe_entry("HOME", "/root"));
        assert!(!is_safe_entry("LD_PRELOAD", "/tmp/evil.so"));
        assert!(!is_safe_entry("PYTHONSTARTUP", "x.py"));
        assert!(!is_safe_entry("CAPGUARD_DEBUG", "1"));
        assert!(!is_safe_entry("1ABC", "x"));
        assert!(!is_safe_entry("A-B", "x"));
        assert!(!is_safe_entry("", "x"));
    }

    #[test]
    fn test_unsafe_values() {
        assert!(!is_safe_entry("A", "x; rm -rf /"));
        assert!(!is_safe_entry("A", "$(id)"));
        assert!(!is_safe_entry("A", "`id`"));
        assert!(!is_safe_entry("A", "line\nbreak"));
        assert!(!is_safe_entry("A", &"x".repeat(MAX_VALUE_LEN + 1)));
    }

    #[test]
    fn test_build_filters_user_entries() {
        let mut config = SandboxConfig::default();
        config.allowed_imports.insert("math".to_string());
        config.allowed_imports.insert("json".to_string());
        config
            .environment_vars
            .insert("APP_MODE".to_string(), "test".to_string());
        config
            .environment_vars
            .insert("PATH".to_string(), "/evil".to_string());
        config
            .environment_vars
            .insert("INJECT".to_string(), "a|b".to_string());

        let env = SandboxEnvironment::build(&config, Path::new("/tmp/run"), "v1.x.y");

        assert_eq!(env.get("PATH"), Some(SAFE_PATH));
        assert_eq!(env.get("TMPDIR"), Some("/tmp/run"));
        assert_eq!(env.get("HOME"), Some("/tmp/run"));
        assert_eq!(env.get("CAPGUARD_CAPABILITY_TOKEN"), Some("v1.x.y"));
        assert_eq!(env.get("CAPGUARD_ALLOWED_IMPORTS"), Some("json,math"));
        assert_eq!(env.get("CAPGUARD_ALLOW_NETWORK"), Some("0"));
        assert_eq!(env.get("APP_MODE"), Some("test"));
        assert_eq!(env.get("INJECT"), None);
        assert_eq!(env.rejected(), ["INJECT".to_string(), "PATH".to_string()]);
        assert_eq!(env.vars().iter().filter(|(k, _)| k == "PATH").count(), 1);
    }
}
