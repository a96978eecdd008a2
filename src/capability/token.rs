use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::error::{CapabilityError, InvalidPatternError};
use super::pattern::{is_permission_name, CapabilityPattern};
use super::restrictions::Restrictions;
use super::Category;

/// Provenance stamped on tokens when the caller does not name an issuer.
pub const DEFAULT_ISSUER: &str = "host";

/// Optional parameters for [`CapabilityContext::grant`](super::CapabilityContext::grant).
#[derive(Debug, Clone, Default)]
pub struct GrantOptions {
    pub granted_by: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub restrictions: Restrictions,
    pub metadata: BTreeMap<String, Value>,
}

impl GrantOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn granted_by(mut self, issuer: impl Into<String>) -> Self {
        self.granted_by = Some(issuer.into());
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn expires_in(self, ttl: Duration) -> Self {
        self.expires_at(Utc::now() + ttl)
    }

    pub fn restriction(mut self, key: &str, value: Value) -> Self {
        self.restrictions.insert(key, value);
        self
    }

    pub fn metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// An immutable grant of one permission over the resources matching one
/// pattern.
///
/// Fields are private; the only way to "change" a token is
/// [`with_restrictions`](Self::with_restrictions), which returns a new,
/// narrower token. Serializes for export only: the pattern's text alone does
/// not record the category it was parsed under.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityToken {
    id: Uuid,
    resource_pattern: CapabilityPattern,
    permission_type: String,
    category: Category,
    granted_by: String,
    issued_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    restrictions: Restrictions,
    metadata: BTreeMap<String, Value>,
}

impl CapabilityToken {
    /// Builds a token for `permission` over `pattern`.
    ///
    /// `pattern` may carry its own `category.permission` qualifier, in which
    /// case it must agree with `permission`.
    pub fn new(
        pattern: &str,
        permission: &str,
        options: GrantOptions,
    ) -> Result<Self, CapabilityError> {
        if !is_permission_name(permission) {
            return Err(InvalidPatternError::new(
                pattern,
                format!("invalid permission '{permission}'"),
            )
            .into());
        }

        let parsed = CapabilityPattern::parse_for(pattern, Category::infer(permission))?;
        if let Some(qualified) = parsed.permission() {
            if qualified != permission {
                return Err(CapabilityError::PermissionMismatch {
                    pattern: pattern.to_string(),
                    qualified: qualified.to_string(),
                    requested: permission.to_string(),
                });
            }
        }
        options.restrictions.validate()?;

        let category = parsed
            .category()
            .unwrap_or_else(|| Category::infer(permission));

        Ok(Self {
            id: Uuid::new_v4(),
            resource_pattern: parsed,
            permission_type: permission.to_string(),
            category,
            granted_by: options
                .granted_by
                .unwrap_or_else(|| DEFAULT_ISSUER.to_string()),
            issued_at: Utc::now(),
            expires_at: options.expires_at,
            restrictions: options.restrictions,
            metadata: options.metadata,
        })
    }

    /// Builds a token from a fully qualified capability string such as
    /// `file.read:/data/*`, taking the permission from the qualifier.
    pub fn from_capability(capability: &str, options: GrantOptions) -> Result<Self, CapabilityError> {
        let parsed = CapabilityPattern::parse(capability)?;
        let permission = parsed
            .permission()
            .ok_or_else(|| {
                InvalidPatternError::new(capability, "missing 'category.permission' qualifier")
            })?
            .to_string();
        Self::new(capability, &permission, options)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn resource_pattern(&self) -> &CapabilityPattern {
        &self.resource_pattern
    }

    pub fn permission_type(&self) -> &str {
        &self.permission_type
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn granted_by(&self) -> &str {
        &self.granted_by
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn restrictions(&self) -> &Restrictions {
        &self.restrictions
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn matches(&self, resource: &str, permission: &str) -> bool {
        self.matches_at(resource, permission, Utc::now())
    }

    /// Same as [`matches`](Self::matches) against an explicit clock reading.
    pub fn matches_at(&self, resource: &str, permission: &str, now: DateTime<Utc>) -> bool {
        self.permission_type == permission
            && self.resource_pattern.matches_resource(resource)
            && self.restrictions.permits(self.category, permission, resource)
            && !self.is_expired(now)
    }

    /// A new token with the same pattern and permission, whose restrictions
    /// are the union of this token's and `extra` (tighter bound wins).
    pub fn with_restrictions(&self, extra: &Restrictions) -> CapabilityToken {
        let mut metadata = self.metadata.clone();
        metadata.insert("derived_from".to_string(), Value::from(self.id.to_string()));

        CapabilityToken {
            id: Uuid::new_v4(),
            resource_pattern: self.resource_pattern.clone(),
            permission_type: self.permission_type.clone(),
            category: self.category,
            granted_by: self.granted_by.clone(),
            issued_at: Utc::now(),
            expires_at: self.expires_at,
            restrictions: self.restrictions.merge(extra),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_matches_requires_permission_and_pattern() {
        let token = CapabilityToken::new("/data/*", "read", GrantOptions::new()).unwrap();
        assert!(token.matches("/data/a.txt", "read"));
        assert!(!token.matches("/data/a.txt", "write"));
        assert!(!token.matches("/etc/passwd", "read"));
        assert_eq!(token.category(), Category::File);
        assert_eq!(token.granted_by(), DEFAULT_ISSUER);
    }

    #[test]
    fn test_expired_token_never_matches() {
        let past = Utc::now() - Duration::seconds(5);
        let token = CapabilityToken::new(
            "/data/*",
            "read",
            GrantOptions::new().expires_at(past),
        )
        .unwrap();
        assert!(token.is_expired(Utc::now()));
        assert!(!token.matches("/data/a.txt", "read"));
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let at = Utc::now() + Duration::seconds(60);
        let token =
            CapabilityToken::new("*", "read", GrantOptions::new().expires_at(at)).unwrap();
        assert!(!token.is_expired(at - Duration::milliseconds(1)));
        assert!(token.is_expired(at));
        assert!(token.matches_at("/x", "read", at - Duration::seconds(1)));
        assert!(!token.matches_at("/x", "read", at));
    }

    #[test]
    fn test_from_capability_takes_permission_from_qualifier() {
        let token =
            CapabilityToken::from_capability("network.https:*.example.com", GrantOptions::new())
                .unwrap();
        assert_eq!(token.permission_type(), "https");
        assert_eq!(token.category(), Category::Network);
        assert!(token.matches("api.example.com", "https"));
    }

    #[test]
    fn test_from_capability_requires_qualifier() {
        let err = CapabilityToken::from_capability("/data/*", GrantOptions::new()).unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidPattern(_)));
    }

    #[test]
    fn test_bare_network_grant_wildcard_is_one_label() {
        let token = CapabilityToken::new("*.example.com", "https", GrantOptions::new()).unwrap();
        assert_eq!(token.category(), Category::Network);
        assert!(token.matches("api.example.com", "https"));
        assert!(!token.matches("a.b.example.com", "https"));
    }

    #[test]
    fn test_qualifier_must_agree_with_permission() {
        let err = CapabilityToken::new("file.read:/data/*", "write", GrantOptions::new())
            .unwrap_err();
        assert!(matches!(err, CapabilityError::PermissionMismatch { .. }));
    }

    #[test]
    fn test_with_restrictions_narrows_and_keeps_source() {
        let token = CapabilityToken::new(
            "/data/**",
            "read",
            GrantOptions::new().restriction("max_bytes", json!(4096)),
        )
        .unwrap();

        let narrowed = token.with_restrictions(
            &Restrictions::new()
                .with("max_bytes", json!(1024))
                .limit_resources(&["/data/public/**"]),
        );

        assert_ne!(narrowed.id(), token.id());
        assert_eq!(narrowed.resource_pattern(), token.resource_pattern());
        assert_eq!(narrowed.restrictions().numeric("max_bytes"), Some(1024.0));
        assert_eq!(token.restrictions().numeric("max_bytes"), Some(4096.0));
        assert!(narrowed.matches("/data/public/a", "read"));
        assert!(!narrowed.matches("/data/private/a", "read"));
        assert!(token.matches("/data/private/a", "read"));
        assert_eq!(
            narrowed.metadata().get("derived_from"),
            Some(&json!(token.id().to_string()))
        );
    }

    #[test]
    fn test_loosening_bound_is_ignored() {
        let token = CapabilityToken::new(
            "*",
            "read",
            GrantOptions::new().restriction("max_bytes", json!(10)),
        )
        .unwrap();
        let widened = token.with_restrictions(&Restrictions::new().with("max_bytes", json!(1000)));
        assert_eq!(widened.restrictions().numeric("max_bytes"), Some(10.0));
    }
}
