use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ExecutionFailure;

const MIB: u64 = 1024 * 1024;

/// Limits and environment for one sandboxed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    /// Enforced by the kernel (`RLIMIT_CPU`) where available.
    #[serde(default = "default_max_cpu_time_seconds")]
    pub max_cpu_time_seconds: u64,
    #[serde(default = "default_max_wall_time_seconds")]
    pub max_wall_time_seconds: u64,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,
    /// Ceiling for each of stdout and stderr.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub allow_network: bool,
    /// Module names the guest runtime may import; carried in the descriptor.
    #[serde(default)]
    pub allowed_imports: BTreeSet<String>,
    /// Extra variables for the guest; only entries passing the safety
    /// filter are forwarded.
    #[serde(default)]
    pub environment_vars: BTreeMap<String, String>,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_interpreter_args")]
    pub interpreter_args: Vec<String>,
    /// Extension of the temporary script file, without the dot.
    #[serde(default = "default_script_extension")]
    pub script_extension: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_memory_mb() -> u64 {
    512
}

fn default_max_cpu_time_seconds() -> u64 {
    30
}

fn default_max_wall_time_seconds() -> u64 {
    60
}

fn default_max_file_size_mb() -> u64 {
    10
}

fn default_max_open_files() -> u64 {
    64
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_interpreter_args() -> Vec<String> {
    vec!["-I".to_string()]
}

fn default_script_extension() -> String {
    "py".to_string()
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: default_max_memory_mb(),
            max_cpu_time_seconds: default_max_cpu_time_seconds(),
            max_wall_time_seconds: default_max_wall_time_seconds(),
            max_file_size_mb: default_max_file_size_mb(),
            max_open_files: default_max_open_files(),
            max_output_bytes: default_max_output_bytes(),
            allow_network: false,
            allowed_imports: BTreeSet::new(),
            environment_vars: BTreeMap::new(),
            interpreter: default_interpreter(),
            interpreter_args: default_interpreter_args(),
            script_extension: default_script_extension(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl SandboxConfig {
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb.saturating_mul(MIB)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(MIB)
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_secs(self.max_wall_time_seconds)
    }

    /// Monitor sampling period, never below 1ms.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Outcome of one sandboxed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxResult {
    /// `exit_code == 0` and no timeout or limit violation.
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Exit status; `128 + signal` when the process was killed by a signal.
    pub exit_code: i32,
    pub execution_time: Duration,
    /// Peak resident memory observed, in bytes.
    pub memory_usage: u64,
    /// Human-readable cause for timeouts and limit violations only.
    pub error: Option<String>,
    pub failure: Option<ExecutionFailure>,
}

impl SandboxResult {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.failure, Some(ExecutionFailure::Timeout(_)))
    }
}
