//! Signed runtime descriptor.
//!
//! The guest process never receives raw capability data it could edit and
//! hand back. It receives `v1.<payload>.<mac>`: the effective capability set
//! as base64url JSON, followed by a hex HMAC-SHA256 over `v1.<payload>`.
//! Bridge calls coming back from the guest present the token, and the host
//! re-validates it with [`DescriptorSigner::verify`] before trusting it.

use std::collections::BTreeSet;

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use super::config::SandboxConfig;
use super::error::DescriptorError;
use crate::capability::{Category, CapabilityContext, CapabilityToken, PatternMatcher, Restrictions};

type HmacSha256 = Hmac<Sha256>;
const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

const VERSION: &str = "v1";
const MAX_TTL_SECS: u64 = 365 * 24 * 3600;

/// One grant as seen by the guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorGrant {
    pub token_id: Uuid,
    pub pattern: String,
    pub permission: String,
    pub category: Category,
    #[serde(default, skip_serializing_if = "Restrictions::is_empty")]
    pub restrictions: Restrictions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl DescriptorGrant {
    /// Same test as [`CapabilityToken::matches_at`].
    fn matches_at(&self, resource: &str, permission: &str, now: DateTime<Utc>) -> bool {
        self.permission == permission
            && self.expires_at.map_or(true, |at| now < at)
            && PatternMatcher::matches_for(&self.pattern, self.category, resource)
            && self.restrictions.permits(self.category, permission, resource)
    }
}

impl From<&CapabilityToken> for DescriptorGrant {
    fn from(token: &CapabilityToken) -> Self {
        Self {
            token_id: token.id(),
            pattern: token.resource_pattern().as_str().to_string(),
            permission: token.permission_type().to_string(),
            category: token.category(),
            restrictions: token.restrictions().clone(),
            expires_at: token.expires_at(),
        }
    }
}

/// One context on the path from the root, with the grants made on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorScope {
    pub context_id: Uuid,
    #[serde(default, skip_serializing_if = "Restrictions::is_empty")]
    pub restrictions: Restrictions,
    pub grants: Vec<DescriptorGrant>,
}

/// Snapshot of what a sandboxed run may do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub session_id: Uuid,
    pub context_id: Uuid,
    /// Context ids from the root down to `context_id`.
    pub context_path: Vec<Uuid>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Root first, one entry per element of `context_path`.
    pub scopes: Vec<DescriptorScope>,
    pub allowed_imports: BTreeSet<String>,
    pub allow_network: bool,
}

impl RuntimeDescriptor {
    /// Captures `context`'s chain of scopes. Valid for the run's wall-time
    /// limit. Grants that can never apply (expired, ruled out by a
    /// restriction, or below the root with no root grant of the same
    /// permission) are left out.
    pub fn from_context(
        context: &CapabilityContext,
        config: &SandboxConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let ttl = Duration::seconds(config.max_wall_time_seconds.min(MAX_TTL_SECS) as i64);
        let snapshots = context.scopes().unwrap_or_default();

        let usable = |token: &CapabilityToken| {
            !token.is_expired(now)
                && !token
                    .restrictions()
                    .excludes(token.category(), token.permission_type())
                && !snapshots.iter().any(|scope| {
                    scope
                        .restrictions
                        .excludes(token.category(), token.permission_type())
                })
        };
        let mut scopes: Vec<DescriptorScope> = snapshots
            .iter()
            .map(|scope| DescriptorScope {
                context_id: scope.context_id,
                restrictions: scope.restrictions.clone(),
                grants: scope
                    .tokens
                    .iter()
                    .map(|token| &**token)
                    .filter(|token| usable(*token))
                    .map(DescriptorGrant::from)
                    .collect(),
            })
            .collect();

        let authorized: BTreeSet<String> = scopes
            .first()
            .map(|root| root.grants.iter().map(|g| g.permission.clone()).collect())
            .unwrap_or_default();
        for scope in scopes.iter_mut().skip(1) {
            scope.grants.retain(|g| authorized.contains(&g.permission));
        }

        Self {
            session_id: context.audit().session_id(),
            context_id: context.id(),
            context_path: context.path().to_vec(),
            issued_at: now,
            expires_at: now + ttl,
            scopes,
            allowed_imports: config.allowed_imports.clone(),
            allow_network: config.allow_network,
        }
    }

    /// Every grant in the snapshot, root scope first.
    pub fn grants(&self) -> impl Iterator<Item = &DescriptorGrant> {
        self.scopes.iter().flat_map(|scope| scope.grants.iter())
    }

    pub fn allows(&self, resource: &str, permission: &str, now: DateTime<Utc>) -> bool {
        self.resolve(resource, permission, now).is_some()
    }

    /// Offline twin of the live check: the root scope must hold a matching
    /// grant, deeper scopes can only substitute their own, and every scope's
    /// restrictions apply separately.
    pub fn resolve(
        &self,
        resource: &str,
        permission: &str,
        now: DateTime<Utc>,
    ) -> Option<&DescriptorGrant> {
        if now >= self.expires_at {
            return None;
        }
        let permitted = |grant: &DescriptorGrant| {
            grant.matches_at(resource, permission, now)
                && self
                    .scopes
                    .iter()
                    .all(|scope| scope.restrictions.permits(grant.category, permission, resource))
        };

        let mut resolved = None;
        for (depth, scope) in self.scopes.iter().enumerate() {
            if depth > 0 && resolved.is_none() {
                return None;
            }
            if let Some(grant) = scope.grants.iter().find(|g| permitted(*g)) {
                resolved = Some(grant);
            }
        }
        resolved
    }
}

/// Signs and verifies descriptors under one HMAC key.
///
/// Each executor generates its own random key, so a token is only valid for
/// the executor (and therefore the host) that issued it.
#[derive(Clone)]
pub struct DescriptorSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for DescriptorSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSigner").finish_non_exhaustive()
    }
}

impl Default for DescriptorSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorSigner {
    /// Fresh random 256-bit key.
    pub fn new() -> Self {
        let key: [u8; 32] = rand::thread_rng().gen();
        Self { key: key.to_vec() }
    }

    pub fn from_key(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    fn mac(&self) -> Result<HmacSha256, DescriptorError> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| DescriptorError::Malformed(format!("signing key: {e}")))
    }

    pub fn sign(&self, descriptor: &RuntimeDescriptor) -> Result<String, DescriptorError> {
        let json = serde_json::to_vec(descriptor)
            .map_err(|e| DescriptorError::Malformed(e.to_string()))?;
        let signed = format!("{VERSION}.{}", B64.encode(json));

        let mut mac = self.mac()?;
        mac.update(signed.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{signed}.{signature}"))
    }

    pub fn verify(&self, token: &str) -> Result<RuntimeDescriptor, DescriptorError> {
        self.verify_at(token, Utc::now())
    }

    /// Checks the MAC before looking at the payload, then the expiry.
    pub fn verify_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<RuntimeDescriptor, DescriptorError> {
        let (signed, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| DescriptorError::Malformed("missing signature".to_string()))?;
        let (version, payload) = signed
            .split_once('.')
            .ok_or_else(|| DescriptorError::Malformed("missing payload".to_string()))?;
        if version != VERSION {
            return Err(DescriptorError::Malformed(format!(
                "unsupported version '{version}'"
            )));
        }
        let signature = hex::decode(signature)
            .map_err(|e| DescriptorError::Malformed(format!("signature: {e}")))?;

        let mut mac = self.mac()?;
        mac.update(signed.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| DescriptorError::BadSignature)?;

        let json = B64
            .decode(payload)
            .map_err(|e| DescriptorError::Malformed(format!("payload: {e}")))?;
        let descriptor: RuntimeDescriptor = serde_json::from_slice(&json)
            .map_err(|e| DescriptorError::Malformed(format!("payload: {e}")))?;

        if now >= descriptor.expires_at {
            return Err(DescriptorError::Expired);
        }
        Ok(descriptor)
    }
}
