use thiserror::Error;

/// A capability pattern that cannot be parsed.
///
/// Raised by `grant` only; malformed patterns never reach `check`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid capability pattern '{pattern}': {reason}")]
pub struct InvalidPatternError {
    pub pattern: String,
    pub reason: String,
}

impl InvalidPatternError {
    pub fn new(pattern: &str, reason: impl Into<String>) -> Self {
        Self {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the capability engine.
///
/// A `check` that returns `false` is the normal deny outcome and is not an
/// error. `Denied` exists for callers that want to turn a deny into a hard
/// failure (see `CapabilityContext::require`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error(transparent)]
    InvalidPattern(#[from] InvalidPatternError),

    #[error("capability denied: '{permission}' on '{resource}'")]
    Denied { resource: String, permission: String },

    #[error("pattern '{pattern}' grants '{qualified}', not '{requested}'")]
    PermissionMismatch {
        pattern: String,
        qualified: String,
        requested: String,
    },

    #[error("invalid resource '{resource}': {reason}")]
    InvalidResource { resource: String, reason: String },
}
