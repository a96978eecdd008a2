//! Hierarchical capability scopes.
//!
//! Contexts form a strict tree: a child holds a `Weak` link to its parent and
//! parents never reference children. A child starts with no tokens of its own
//! and answers checks by delegating up the chain, filtered through every
//! restriction set between the root and itself.
//!
//! Authority always originates at the root. Tokens granted on a non-root
//! context are attenuations: they only take effect where the chain above
//! already allows the same `(resource, permission)`, and when they do they
//! become the resolving token (so their restrictions reach the caller).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::audit::{AuditEvent, AuditLog, CheckOutcome};
use super::cache::{CapabilityCache, ResolvedBy, DEFAULT_CACHE_SIZE};
use super::error::CapabilityError;
use super::restrictions::Restrictions;
use super::token::{CapabilityToken, GrantOptions};

/// Which token answered a check, and where it lives.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub token: Arc<CapabilityToken>,
    pub context_id: Uuid,
    /// Earliest expiry among the tokens that backed the decision, the
    /// root's authority included.
    pub valid_until: Option<DateTime<Utc>>,
}

impl Resolution {
    pub fn resolved_by(&self) -> ResolvedBy {
        ResolvedBy {
            token_id: self.token.id(),
            context_id: self.context_id,
        }
    }
}

/// One level of a context chain, frozen: its id, its own restrictions and
/// the tokens granted directly on it.
#[derive(Debug, Clone)]
pub struct ScopeSnapshot {
    pub context_id: Uuid,
    pub restrictions: Restrictions,
    pub tokens: Vec<Arc<CapabilityToken>>,
}

#[derive(Debug)]
pub struct CapabilityContext {
    id: Uuid,
    parent: Option<Weak<CapabilityContext>>,
    /// Context ids from the root down to this context.
    path: Vec<Uuid>,
    tokens: RwLock<Vec<Arc<CapabilityToken>>>,
    restrictions: Restrictions,
    cache: CapabilityCache,
    audit: Arc<AuditLog>,
    /// Bumped by every grant anywhere in the tree.
    lineage: Arc<AtomicU64>,
    /// Value of `lineage` when this context's cache was last known fresh.
    cache_generation: AtomicU64,
}

impl CapabilityContext {
    /// A new root context reporting to `audit`.
    pub fn root(audit: Arc<AuditLog>) -> Arc<Self> {
        Self::root_with_cache_size(audit, DEFAULT_CACHE_SIZE)
    }

    pub fn root_with_cache_size(audit: Arc<AuditLog>, cache_size: usize) -> Arc<Self> {
        let id = Uuid::new_v4();
        Arc::new(Self {
            id,
            parent: None,
            path: vec![id],
            tokens: RwLock::new(Vec::new()),
            restrictions: Restrictions::new(),
            cache: CapabilityCache::new(cache_size),
            audit,
            lineage: Arc::new(AtomicU64::new(0)),
            cache_generation: AtomicU64::new(0),
        })
    }

    /// A child scope of `self`, narrowed by `restrictions`.
    ///
    /// Nothing is copied: the child owns no tokens and an empty cache, and
    /// dropping it has no effect on `self`.
    pub fn create_child(
        self: &Arc<Self>,
        restrictions: Restrictions,
    ) -> Result<Arc<Self>, CapabilityError> {
        restrictions.validate()?;

        let id = Uuid::new_v4();
        let mut path = self.path.clone();
        path.push(id);

        debug!(
            "Context {id} created under {} ({} restriction(s))",
            self.id,
            restrictions.len()
        );

        Ok(Arc::new(Self {
            id,
            parent: Some(Arc::downgrade(self)),
            path,
            tokens: RwLock::new(Vec::new()),
            restrictions,
            cache: CapabilityCache::new(self.cache.max_size()),
            audit: Arc::clone(&self.audit),
            lineage: Arc::clone(&self.lineage),
            cache_generation: AtomicU64::new(self.lineage.load(Ordering::SeqCst)),
        }))
    }

    // ── Grants ──────────────────────────────────────────

    /// Appends a token for `permission` over `pattern`.
    ///
    /// Invalidates the whole cache and records a grant event. Fails on a
    /// malformed pattern or restriction set.
    pub fn grant(
        &self,
        pattern: &str,
        permission: &str,
        options: GrantOptions,
    ) -> Result<Arc<CapabilityToken>, CapabilityError> {
        let token = CapabilityToken::new(pattern, permission, options)?;
        Ok(self.append(token))
    }

    /// Grants a fully qualified capability string such as `file.read:/data/*`.
    pub fn grant_capability(
        &self,
        capability: &str,
        options: GrantOptions,
    ) -> Result<Arc<CapabilityToken>, CapabilityError> {
        let token = CapabilityToken::from_capability(capability, options)?;
        Ok(self.append(token))
    }

    fn append(&self, token: CapabilityToken) -> Arc<CapabilityToken> {
        let token = Arc::new(token);
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&token));
        self.cache.invalidate_all();
        self.lineage.fetch_add(1, Ordering::SeqCst);

        debug!(
            "Granted {} '{}' in context {} (token {})",
            token.permission_type(),
            token.resource_pattern(),
            self.id,
            token.id()
        );
        self.audit.record(AuditEvent::Grant {
            context_id: self.id,
            token_id: token.id(),
            pattern: token.resource_pattern().to_string(),
            permission: token.permission_type().to_string(),
            granted_by: token.granted_by().to_string(),
            expires_at: token.expires_at(),
        });

        token
    }

    // ── Checks ──────────────────────────────────────────

    /// Is `permission` on `resource` allowed in this context?
    ///
    /// Deny by default: no matching token means `false`. Only the cache and
    /// the audit log are touched.
    pub fn check(&self, resource: &str, permission: &str) -> bool {
        self.check_at(resource, permission, Utc::now())
    }

    /// [`check`](Self::check) against an explicit clock reading.
    pub fn check_at(&self, resource: &str, permission: &str, now: DateTime<Utc>) -> bool {
        let generation = self.refresh_cache();

        if let Some(cached) = self.cache.lookup_at(resource, permission, now) {
            self.record_check(resource, permission, cached.result, cached.resolved_by, true);
            return cached.result;
        }

        let resolution = self.resolve(resource, permission, now);
        let granted = resolution.is_some();
        let resolved_by = resolution.as_ref().map(Resolution::resolved_by);

        if self.lineage.load(Ordering::SeqCst) == generation {
            let valid_until = resolution.as_ref().and_then(|r| r.valid_until);
            self.cache
                .put_resolved(resource, permission, granted, valid_until, resolved_by);
        }

        if !granted {
            debug!(
                "Denied {permission} on '{resource}' in context {}",
                self.id
            );
        }
        self.record_check(resource, permission, granted, resolved_by, false);
        granted
    }

    /// Like [`check`](Self::check) but also returns the resolving token.
    /// Bypasses the cache so the answer always carries its provenance.
    pub fn resolve_now(&self, resource: &str, permission: &str) -> Option<Resolution> {
        let resolution = self.resolve(resource, permission, Utc::now());
        self.record_check(
            resource,
            permission,
            resolution.is_some(),
            resolution.as_ref().map(Resolution::resolved_by),
            false,
        );
        resolution
    }

    /// Converts a deny into [`CapabilityError::Denied`], naming the resource.
    pub fn require(&self, resource: &str, permission: &str) -> Result<(), CapabilityError> {
        if self.check(resource, permission) {
            Ok(())
        } else {
            Err(CapabilityError::Denied {
                resource: resource.to_string(),
                permission: permission.to_string(),
            })
        }
    }

    /// Runs a bridge function only if `permission` on `resource` is allowed.
    pub fn guard<T>(
        &self,
        resource: &str,
        permission: &str,
        f: impl FnOnce() -> T,
    ) -> Result<T, CapabilityError> {
        self.require(resource, permission)?;
        Ok(f())
    }

    /// Clears the cache if any context in the tree granted since the last
    /// check here. Returns the generation the caller is working under.
    fn refresh_cache(&self) -> u64 {
        let current = self.lineage.load(Ordering::SeqCst);
        if self.cache_generation.swap(current, Ordering::SeqCst) != current {
            self.cache.invalidate_all();
        }
        current
    }

    /// Self first, then each ancestor up to the root. `None` if an ancestor
    /// has already been dropped.
    fn chain(&self) -> Option<Vec<Arc<CapabilityContext>>> {
        let mut ancestors = Vec::new();
        let mut next = self.parent.clone();
        while let Some(weak) = next {
            let parent = weak.upgrade()?;
            next = parent.parent.clone();
            ancestors.push(parent);
        }
        Some(ancestors)
    }

    fn resolve(&self, resource: &str, permission: &str, now: DateTime<Utc>) -> Option<Resolution> {
        let Some(ancestors) = self.chain() else {
            warn!(
                "Context {} outlived its parent; denying {permission} on '{resource}'",
                self.id
            );
            return None;
        };

        let levels: Vec<&CapabilityContext> = std::iter::once(self)
            .chain(ancestors.iter().map(Arc::as_ref))
            .collect();

        let permitted = |token: &CapabilityToken| {
            token.matches_at(resource, permission, now)
                && levels
                    .iter()
                    .all(|ctx| ctx.restrictions.permits(token.category(), permission, resource))
        };

        // Root first: authority must exist there, deeper levels can only
        // substitute a narrower resolving token.
        let mut resolution: Option<Resolution> = None;
        for (depth, ctx) in levels.iter().rev().enumerate() {
            if depth > 0 && resolution.is_none() {
                return None;
            }
            let local = ctx
                .tokens
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .find(|token| permitted(Arc::as_ref(token)))
                .cloned();
            if let Some(token) = local {
                let backing = resolution.as_ref().and_then(|r| r.valid_until);
                resolution = Some(Resolution {
                    valid_until: earliest(backing, token.expires_at()),
                    token,
                    context_id: ctx.id,
                });
            }
        }
        resolution
    }

    fn record_check(
        &self,
        resource: &str,
        permission: &str,
        granted: bool,
        resolved_by: Option<ResolvedBy>,
        cached: bool,
    ) {
        self.audit.record(AuditEvent::Check {
            resource: resource.to_string(),
            permission: permission.to_string(),
            outcome: CheckOutcome::from_bool(granted),
            resolving_token_id: resolved_by.map(|r| r.token_id),
            resolving_context_id: resolved_by.map(|r| r.context_id),
            context_path: self.path.clone(),
            cached,
        });
    }

    // ── Introspection ───────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &[Uuid] {
        &self.path
    }

    /// 0 for a root context.
    pub fn depth(&self) -> usize {
        self.path.len() - 1
    }

    pub fn parent(&self) -> Option<Arc<CapabilityContext>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn restrictions(&self) -> &Restrictions {
        &self.restrictions
    }

    pub fn cache(&self) -> &CapabilityCache {
        &self.cache
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Tokens granted directly on this context, in grant order.
    pub fn tokens(&self) -> Vec<Arc<CapabilityToken>> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every restriction on the chain from the root to here, merged.
    pub fn effective_restrictions(&self) -> Restrictions {
        let ancestors = self.chain().unwrap_or_default();
        ancestors
            .iter()
            .rev()
            .map(|ctx| &ctx.restrictions)
            .chain(std::iter::once(&self.restrictions))
            .fold(Restrictions::new(), |acc, r| acc.merge(r))
    }

    /// The chain from the root down to this context, root first. `None` if
    /// an ancestor has been dropped.
    pub fn scopes(&self) -> Option<Vec<ScopeSnapshot>> {
        let ancestors = self.chain()?;
        let scopes = ancestors
            .iter()
            .rev()
            .map(Arc::as_ref)
            .chain(std::iter::once(self))
            .map(|ctx| ScopeSnapshot {
                context_id: ctx.id,
                restrictions: ctx.restrictions.clone(),
                tokens: ctx.tokens(),
            })
            .collect();
        Some(scopes)
    }

    /// The root's unexpired tokens, each narrowed by every restriction on
    /// the chain down to here. Tokens granted below the root only ever stand
    /// in for one of these, so they add no authority and are left out.
    /// Empty if an ancestor has been dropped.
    pub fn effective_tokens(&self) -> Vec<CapabilityToken> {
        let Some(scopes) = self.scopes() else {
            return Vec::new();
        };
        let restrictions = scopes
            .iter()
            .fold(Restrictions::new(), |acc, scope| acc.merge(&scope.restrictions));
        let now = Utc::now();

        scopes
            .first()
            .map(|root| root.tokens.as_slice())
            .unwrap_or_default()
            .iter()
            .filter(|token| !token.is_expired(now))
            .filter(|token| !restrictions.excludes(token.category(), token.permission_type()))
            .map(|token| token.with_restrictions(&restrictions))
            .collect()
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
