//! Capability engine: tokens, hierarchical contexts, pattern matching,
//! per-context caching and the session audit log.
//!
//! Every sensitive operation presents a `(resource, permission)` pair to a
//! [`CapabilityContext`]. Absence of a matching token is a deny, never an
//! error.

pub mod audit;
pub mod cache;
pub mod context;
pub mod error;
pub mod pattern;
pub mod resource;
pub mod restrictions;
pub mod token;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use audit::{AuditEntry, AuditEvent, AuditLog, CheckOutcome};
pub use cache::{CacheStats, CachedDecision, CapabilityCache, ResolvedBy};
pub use context::{CapabilityContext, Resolution, ScopeSnapshot};
pub use error::{CapabilityError, InvalidPatternError};
pub use pattern::{CapabilityPattern, PatternMatcher, ResourcePattern};
pub use restrictions::Restrictions;
pub use token::{CapabilityToken, GrantOptions};

/// Resource family a capability belongs to.
///
/// Closed set; a capability string is only treated as qualified when its
/// prefix names one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    File,
    Network,
    System,
    Process,
    Env,
}

impl Category {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Category::File),
            "network" => Some(Category::Network),
            "system" => Some(Category::System),
            "process" => Some(Category::Process),
            "env" => Some(Category::Env),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::File => "file",
            Category::Network => "network",
            Category::System => "system",
            Category::Process => "process",
            Category::Env => "env",
        }
    }

    /// Category implied by a bare permission name, used for tokens granted
    /// without a `category.permission` qualifier.
    pub fn infer(permission: &str) -> Self {
        match permission {
            "read" | "write" | "execute" | "delete" | "create" | "list" | "append" => {
                Category::File
            }
            "http" | "https" | "ws" | "wss" | "tcp" | "udp" | "dns" | "connect" => {
                Category::Network
            }
            "spawn" | "kill" | "signal" => Category::Process,
            _ => Category::System,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
