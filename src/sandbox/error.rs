use std::time::Duration;

use thiserror::Error;

use crate::capability::CapabilityError;

/// A sandboxed run crossed one of its resource ceilings.
///
/// Always fatal to the current run; never downgraded to a warning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceLimitError {
    #[error("memory limit exceeded: {observed_bytes} bytes resident, limit {limit_bytes} bytes")]
    Memory {
        observed_bytes: u64,
        limit_bytes: u64,
    },

    #[error("wall_time limit exceeded: {:.3}s elapsed, limit {:.3}s", elapsed.as_secs_f64(), limit.as_secs_f64())]
    WallTime { elapsed: Duration, limit: Duration },

    #[error("open_files limit exceeded: {observed} open, limit {limit}")]
    OpenFiles { observed: u64, limit: u64 },

    #[error("cpu_time limit exceeded: limit {limit_secs}s")]
    CpuTime { limit_secs: u64 },

    #[error("file_size limit exceeded: limit {limit_bytes} bytes")]
    FileSize { limit_bytes: u64 },
}

impl ResourceLimitError {
    /// Short name of the limit, as used in reports and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceLimitError::Memory { .. } => "memory",
            ResourceLimitError::WallTime { .. } => "wall_time",
            ResourceLimitError::OpenFiles { .. } => "open_files",
            ResourceLimitError::CpuTime { .. } => "cpu_time",
            ResourceLimitError::FileSize { .. } => "file_size",
        }
    }
}

/// The wall-clock deadline fired on the process-wait path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("execution timed out after {:.3}s", limit.as_secs_f64())]
pub struct ExecutionTimeoutError {
    pub limit: Duration,
}

/// Why a signed runtime descriptor was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("malformed capability token: {0}")]
    Malformed(String),

    #[error("capability token signature mismatch")]
    BadSignature,

    #[error("capability token expired")]
    Expired,
}

/// Structured cause of an unsuccessful run that was not a plain non-zero exit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionFailure {
    #[error(transparent)]
    Timeout(#[from] ExecutionTimeoutError),

    #[error(transparent)]
    ResourceLimit(#[from] ResourceLimitError),
}

/// Errors that prevent a sandboxed run from happening at all.
///
/// Timeouts and limit violations are not here: they are reported inside a
/// `SandboxResult`.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Host-environment fault (cannot create the scratch dir, cannot spawn).
    /// Never retried.
    #[error("sandbox infrastructure failure: {0}")]
    Infrastructure(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

impl SandboxError {
    pub fn infrastructure(context: &str, err: impl std::fmt::Display) -> Self {
        SandboxError::Infrastructure(format!("{context}: {err}"))
    }
}
