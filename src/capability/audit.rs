//! Append-only audit trail for one execution session.
//!
//! Records every grant, every check outcome and the sandbox lifecycle.
//! Sequence numbers and timestamps are assigned under the same lock that
//! appends the entry, so the in-memory order, the sequence order and the
//! JSONL file order always agree.
//!
//! Optional on-disk sink: one JSON object per line (`audit.jsonl`), appended
//! and flushed per entry. With a sink the file is the complete record and
//! memory keeps only the most recent entries; without one every entry stays
//! in memory.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    Granted,
    Denied,
}

impl CheckOutcome {
    pub fn from_bool(granted: bool) -> Self {
        if granted {
            CheckOutcome::Granted
        } else {
            CheckOutcome::Denied
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Started,
    Finished,
    TimedOut,
    LimitExceeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Grant {
        context_id: Uuid,
        token_id: Uuid,
        pattern: String,
        permission: String,
        granted_by: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
    },
    Check {
        resource: String,
        permission: String,
        outcome: CheckOutcome,
        /// Token that granted access; `None` on deny.
        #[serde(skip_serializing_if = "Option::is_none")]
        resolving_token_id: Option<Uuid>,
        /// Context that owns the resolving token.
        #[serde(skip_serializing_if = "Option::is_none")]
        resolving_context_id: Option<Uuid>,
        /// Context ids from the root down to the context that was asked.
        context_path: Vec<Uuid>,
        cached: bool,
    },
    Execution {
        context_id: Uuid,
        phase: ExecutionPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditEntry {
    pub fn is_denial(&self) -> bool {
        matches!(
            self.event,
            AuditEvent::Check {
                outcome: CheckOutcome::Denied,
                ..
            }
        )
    }
}

/// Entries kept in memory when a sink holds the full trail.
pub const DEFAULT_RETAINED_ENTRIES: usize = 4096;

#[derive(Debug, Default)]
struct AuditInner {
    entries: VecDeque<AuditEntry>,
    next_sequence: u64,
    denied: u64,
    sink: Option<File>,
    /// `None` keeps everything.
    retain: Option<usize>,
}

/// Session-scoped audit log. Shared between all contexts of one session
/// through an `Arc`; never shared across sessions.
#[derive(Debug)]
pub struct AuditLog {
    session_id: Uuid,
    inner: Mutex<AuditInner>,
}

impl AuditLog {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            inner: Mutex::new(AuditInner::default()),
        }
    }

    /// Like [`new`](Self::new), additionally appending every entry to the
    /// JSONL file at `path` (parent directories are created). Memory keeps
    /// the last [`DEFAULT_RETAINED_ENTRIES`].
    pub fn with_sink(session_id: Uuid, path: &Path) -> std::io::Result<Self> {
        Self::with_sink_retaining(session_id, path, DEFAULT_RETAINED_ENTRIES)
    }

    pub fn with_sink_retaining(
        session_id: Uuid,
        path: &Path,
        retain: usize,
    ) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("Audit log for session {session_id} at {}", path.display());

        Ok(Self {
            session_id,
            inner: Mutex::new(AuditInner {
                sink: Some(file),
                retain: Some(retain),
                ..AuditInner::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, AuditInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Appends one event and returns the stored entry.
    pub fn record(&self, event: AuditEvent) -> AuditEntry {
        let mut inner = self.lock();

        let entry = AuditEntry {
            sequence: inner.next_sequence,
            timestamp: Utc::now(),
            session_id: self.session_id,
            event,
        };
        inner.next_sequence += 1;
        if entry.is_denial() {
            inner.denied += 1;
        }

        if let Some(sink) = inner.sink.as_mut() {
            let written = serde_json::to_string(&entry)
                .map_err(std::io::Error::from)
                .and_then(|line| writeln!(sink, "{line}"))
                .and_then(|_| sink.flush());
            if let Err(e) = written {
                warn!("Failed to append audit entry {}: {e}", entry.sequence);
            }
        }

        if let Some(retain) = inner.retain {
            while inner.entries.len() >= retain.max(1) {
                inner.entries.pop_front();
            }
        }
        inner.entries.push_back(entry.clone());
        entry
    }

    /// Snapshot of the entries held in memory, in chronological order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Denials among the entries held in memory.
    pub fn denials(&self) -> Vec<AuditEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.is_denial())
            .cloned()
            .collect()
    }

    /// Entries held in memory; see [`recorded`](Self::recorded) for the
    /// total.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Entries recorded over the whole session, including any dropped from
    /// memory.
    pub fn recorded(&self) -> u64 {
        self.lock().next_sequence
    }

    /// Denials recorded over the whole session.
    pub fn denial_count(&self) -> u64 {
        self.lock().denied
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn check_event(resource: &str, granted: bool) -> AuditEvent {
        AuditEvent::Check {
            resource: resource.to_string(),
            permission: "read".to_string(),
            outcome: CheckOutcome::from_bool(granted),
            resolving_token_id: None,
            resolving_context_id: None,
            context_path: vec![Uuid::new_v4()],
            cached: false,
        }
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let log = AuditLog::new(Uuid::new_v4());
        let a = log.record(check_event("/a", true));
        let b = log.record(check_event("/b", false));
        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
        assert!(a.timestamp <= b.timestamp);
        assert_eq!(log.len(), 2);
        assert_eq!(log.denials().len(), 1);
        assert_eq!(log.entries()[1].session_id, log.session_id());
    }

    #[test]
    fn test_concurrent_appends_keep_order() {
        let log = Arc::new(AuditLog::new(Uuid::new_v4()));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        log.record(check_event(&format!("/t{t}/{i}"), true));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let entries = log.entries();
        assert_eq!(entries.len(), 200);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.sequence, i as u64);
        }
        assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_jsonl_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");
        let log = AuditLog::with_sink(Uuid::new_v4(), &path).unwrap();

        log.record(check_event("/etc/passwd", false));
        log.record(AuditEvent::Execution {
            context_id: Uuid::new_v4(),
            phase: ExecutionPhase::Started,
            detail: None,
        });

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "check");
        assert_eq!(first["outcome"], "denied");
        assert_eq!(first["resource"], "/etc/passwd");
        assert_eq!(first["sequence"], 0);

        let back: AuditEntry = serde_json::from_str(lines[1]).unwrap();
        assert!(matches!(
            back.event,
            AuditEvent::Execution {
                phase: ExecutionPhase::Started,
                ..
            }
        ));
    }

    // ── Retention ───────────────────────────────────────

    #[test]
    fn test_sink_bounds_memory_but_keeps_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::with_sink_retaining(Uuid::new_v4(), &path, 3).unwrap();

        for i in 0..10 {
            log.record(check_event(&format!("/r{i}"), i % 2 == 0));
        }

        assert_eq!(log.len(), 3);
        assert_eq!(log.recorded(), 10);
        let sequences: Vec<u64> = log.entries().iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![7, 8, 9]);
        assert_eq!(log.denials().len(), 2);
        assert_eq!(log.denial_count(), 5);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 10);
    }

    #[test]
    fn test_memory_only_log_keeps_everything() {
        let log = AuditLog::new(Uuid::new_v4());
        for i in 0..(DEFAULT_RETAINED_ENTRIES + 10) {
            log.record(check_event(&format!("/r{i}"), true));
        }
        assert_eq!(log.len(), DEFAULT_RETAINED_ENTRIES + 10);
        assert_eq!(log.recorded(), log.len() as u64);
    }
}
