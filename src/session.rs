use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;
use uuid::Uuid;

use crate::capability::cache::DEFAULT_CACHE_SIZE;
use crate::capability::{AuditLog, CapabilityContext};
use crate::config::Config;
use crate::sandbox::{SandboxConfig, SandboxError, SandboxExecutor, SandboxResult};

/// One execution session: a root capability context, the audit log every
/// context in its tree reports to, and the executor that runs guest code.
///
/// Sessions share nothing. Pass the session (or one of its contexts)
/// explicitly to whatever needs capability checks.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    audit: Arc<AuditLog>,
    root: Arc<CapabilityContext>,
    sandbox: SandboxConfig,
    executor: SandboxExecutor,
}

impl Session {
    /// Empty session: in-memory audit log, no grants.
    pub fn new(sandbox: SandboxConfig) -> Self {
        let id = Uuid::new_v4();
        let audit = Arc::new(AuditLog::new(id));
        let root = CapabilityContext::root_with_cache_size(Arc::clone(&audit), DEFAULT_CACHE_SIZE);
        Self {
            id,
            audit,
            root,
            sandbox,
            executor: SandboxExecutor::new(),
        }
    }

    /// Session with the configured audit sink, cache size and root grants.
    pub fn from_config(config: &Config) -> Result<Self> {
        let id = Uuid::new_v4();
        let audit = match &config.audit.path {
            Some(path) => AuditLog::with_sink_retaining(id, path, config.audit.retain_entries)
                .map_err(|e| anyhow!("Cannot open audit log {}: {e}", path.display()))?,
            None => AuditLog::new(id),
        };
        let audit = Arc::new(audit);
        let root = CapabilityContext::root_with_cache_size(Arc::clone(&audit), config.cache.max_size);

        for grant in &config.capabilities {
            root.grant_capability(&grant.capability, grant.options(&config.session.granted_by))
                .map_err(|e| anyhow!("Invalid capability '{}': {e}", grant.capability))?;
        }
        info!(
            "Session {id} ready with {} configured capabilit{}",
            config.capabilities.len(),
            if config.capabilities.len() == 1 { "y" } else { "ies" }
        );

        Ok(Self {
            id,
            audit,
            root,
            sandbox: config.sandbox.clone(),
            executor: SandboxExecutor::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root(&self) -> &Arc<CapabilityContext> {
        &self.root
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn sandbox(&self) -> &SandboxConfig {
        &self.sandbox
    }

    pub fn executor(&self) -> &SandboxExecutor {
        &self.executor
    }

    /// Runs `code` with the root context's capabilities.
    pub async fn execute(&self, code: &str) -> Result<SandboxResult, SandboxError> {
        self.execute_in(code, &self.root).await
    }

    /// Runs `code` with the capabilities of `context`, which should belong
    /// to this session's tree.
    pub async fn execute_in(
        &self,
        code: &str,
        context: &Arc<CapabilityContext>,
    ) -> Result<SandboxResult, SandboxError> {
        self.executor.execute(code, &self.sandbox, context).await
    }
}
