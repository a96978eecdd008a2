//! Execution sandbox for generated guest code.
//!
//! Isolation is process-level: each run gets its own scratch directory,
//! an empty-by-default environment, its own process group and kernel
//! rlimits, and is supervised by a wall-clock deadline and a polling
//! resource monitor. Capabilities reach the guest only as a signed,
//! opaque descriptor.

pub mod config;
pub mod descriptor;
pub mod env;
pub mod error;
pub mod executor;
pub mod monitor;

pub use config::{SandboxConfig, SandboxResult};
pub use descriptor::{DescriptorGrant, DescriptorSigner, RuntimeDescriptor};
pub use env::{ReservedVar, SandboxEnvironment};
pub use error::{
    DescriptorError, ExecutionFailure, ExecutionTimeoutError, ResourceLimitError, SandboxError,
};
pub use executor::SandboxExecutor;
pub use monitor::{MonitorState, ProcProbe, ResourceMonitor, ResourceProbe, ResourceUsage};
