//! Caller-side canonicalization of resource identifiers.
//!
//! The matcher compares strings only. Whatever hands a resource to
//! `CapabilityContext::check` must first turn it into canonical form with
//! these helpers: `~` expanded, relative paths anchored, `.`/`..` folded,
//! and optionally symlinks resolved.

use std::path::{Component, Path, PathBuf};

use super::error::CapabilityError;

fn invalid(resource: &str, reason: impl Into<String>) -> CapabilityError {
    CapabilityError::InvalidResource {
        resource: resource.to_string(),
        reason: reason.into(),
    }
}

/// Absolute, lexically normalized form of `raw`, resolved against `cwd`.
///
/// `..` never climbs above `/`. Does not touch the filesystem.
pub fn canonical_path(raw: &str, cwd: &Path) -> Result<String, CapabilityError> {
    if raw.is_empty() {
        return Err(invalid(raw, "empty path"));
    }
    if raw.contains('\0') {
        return Err(invalid(raw, "NUL byte in path"));
    }

    let expanded = shellexpand::tilde(raw);
    let path = Path::new(&*expanded);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        if !cwd.is_absolute() {
            return Err(invalid(raw, format!("base directory {} is relative", cwd.display())));
        }
        cwd.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }

    normalized
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(raw, "path is not valid UTF-8"))
}

/// [`canonical_path`] followed by symlink resolution on the real
/// filesystem. Fails if the path does not exist.
pub fn resolve_symlinks(raw: &str, cwd: &Path) -> Result<String, CapabilityError> {
    let lexical = canonical_path(raw, cwd)?;
    let resolved = std::fs::canonicalize(&lexical)
        .map_err(|e| invalid(raw, format!("cannot resolve: {e}")))?;
    resolved
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(raw, "path is not valid UTF-8"))
}

/// Splits a URL into `(scheme, resource)` for a network check, e.g.
/// `https://API.example.com/v1/users` → `("https", "api.example.com/v1/users")`.
///
/// Non-default ports are kept (`host:8443`); credentials, query and
/// fragment are dropped.
pub fn network_resource(raw: &str) -> Result<(String, String), CapabilityError> {
    let url = url::Url::parse(raw).map_err(|e| invalid(raw, format!("invalid URL: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| invalid(raw, "URL has no host"))?
        .to_lowercase();

    let mut resource = host;
    if let Some(port) = url.port() {
        resource.push_str(&format!(":{port}"));
    }
    let path = url.path();
    if !path.is_empty() && path != "/" {
        resource.push_str(path);
    }

    Ok((url.scheme().to_string(), resource))
}
