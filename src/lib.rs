//! Capability-based access control for untrusted guest code.
//!
//! Every sensitive operation presents a `(resource, permission)` pair to a
//! [`CapabilityContext`]. Contexts form a tree, children can only narrow
//! what their parents allow, and everything is recorded in a per-session
//! [`AuditLog`]. Generated guest programs run in a [`SandboxExecutor`]
//! subprocess with enforced resource ceilings.

pub mod capability;
pub mod config;
pub mod sandbox;
pub mod session;

pub use capability::{
    AuditEntry, AuditEvent, AuditLog, CapabilityContext, CapabilityError, CapabilityToken,
    Category, GrantOptions, InvalidPatternError, PatternMatcher, Restrictions,
};
pub use config::Config;
pub use sandbox::{SandboxConfig, SandboxError, SandboxExecutor, SandboxResult};
pub use session::Session;
