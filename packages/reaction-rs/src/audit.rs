//! Flow auditing for tooling and debugging.
//!
//! Every flow, completed or aborted, leaves one [`AuditEntry`] in the
//! reactor's [`FlowAuditLog`]. Editors and debuggers read the log instead of
//! reaching into the reactor's internals.
//!
//! # Purpose
//!
//! Auditing catches:
//! - Reaction loops (entries aborted with a cycle)
//! - Runaway fan-out (entries aborted at the depth limit)
//! - Broken performers (entries aborted with a performer failure)
//!
//! # Usage
//!
//! ```ignore
//! for entry in reactor.audit().aborted() {
//!     tracing::warn!(
//!         kind = entry.kind,
//!         reason = ?entry.abort_reason,
//!         "flow did not complete"
//!     );
//! }
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::Action;
use crate::error::ReactorError;
use crate::identity::Identity;

/// Default number of audit entries to retain.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

/// Why an audited flow did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AbortReason {
    /// Identity already in flight.
    Cycle,
    /// Flow depth limit reached.
    Depth,
    /// Performer failed or panicked.
    Performer,
    /// Identity hook panicked.
    Identity,
    /// Anything else.
    Other,
}

impl From<&ReactorError> for AbortReason {
    fn from(err: &ReactorError) -> Self {
        match err {
            ReactorError::CycleDetected { .. } => AbortReason::Cycle,
            ReactorError::DepthExceeded { .. } => AbortReason::Depth,
            ReactorError::PerformerFailed { .. } => AbortReason::Performer,
            ReactorError::IdentityFailed { .. } => AbortReason::Identity,
            _ => AbortReason::Other,
        }
    }
}

/// A single audit entry for one flow.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Short kind name of the action.
    pub kind: &'static str,
    /// Identity of the action. `None` if the identity hook panicked.
    pub identity: Option<Identity>,
    /// In-flight count while the flow ran (0 if it never entered).
    pub depth: usize,
    /// Lineage chain depth of the action.
    pub chain_depth: usize,
    /// Whether the flow passed its guard (entered and left the flow stack).
    pub guarded: bool,
    /// Why the flow stopped early, if it did.
    pub abort_reason: Option<AbortReason>,
    /// Rendered abort error, if any.
    pub message: Option<String>,
    /// When the flow started.
    pub started_at: DateTime<Utc>,
    /// When the flow ended.
    pub finished_at: DateTime<Utc>,
}

impl AuditEntry {
    pub(crate) fn new(
        action: &Action,
        identity: Option<Identity>,
        depth: usize,
        started_at: DateTime<Utc>,
        guarded: bool,
        error: Option<&ReactorError>,
    ) -> Self {
        Self {
            kind: action.kind_name(),
            identity,
            depth,
            chain_depth: action.chain_depth(),
            guarded,
            abort_reason: error.map(AbortReason::from),
            message: error.map(|e| e.to_string()),
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Returns true if every phase ran.
    pub fn completed(&self) -> bool {
        self.abort_reason.is_none()
    }
}

/// Bounded log of recent flows.
#[derive(Debug)]
pub struct FlowAuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl Default for FlowAuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl FlowAuditLog {
    /// Create a log retaining at most `capacity` entries. Zero disables it.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_AUDIT_CAPACITY))),
            capacity,
        }
    }

    /// Acquire the entries lock, recovering from poison if necessary.
    fn lock_entries(&self) -> MutexGuard<'_, VecDeque<AuditEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Maximum number of retained entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record an audit entry.
    pub fn record(&self, entry: AuditEntry) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.lock_entries();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Get all retained entries, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock_entries().iter().cloned().collect()
    }

    /// Get the most recent N entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        self.lock_entries().iter().rev().take(n).cloned().collect()
    }

    /// Get entries for flows that did not complete.
    pub fn aborted(&self) -> Vec<AuditEntry> {
        self.lock_entries()
            .iter()
            .filter(|e| !e.completed())
            .cloned()
            .collect()
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.lock_entries().clear();
    }

    /// Get the number of entries.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Get summary statistics.
    pub fn stats(&self) -> AuditStats {
        let entries = self.lock_entries();
        let count = |reason: AbortReason| {
            entries
                .iter()
                .filter(|e| e.abort_reason == Some(reason))
                .count()
        };

        AuditStats {
            total_flows: entries.len(),
            completed: entries.iter().filter(|e| e.completed()).count(),
            guarded: entries.iter().filter(|e| e.guarded).count(),
            cycles: count(AbortReason::Cycle),
            depth_exceeded: count(AbortReason::Depth),
            performer_failures: count(AbortReason::Performer),
        }
    }
}

/// Summary statistics from the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    /// Total number of flows recorded.
    pub total_flows: usize,
    /// Flows where every phase ran.
    pub completed: usize,
    /// Flows that entered and left the flow stack.
    pub guarded: usize,
    /// Flows refused as cycles.
    pub cycles: usize,
    /// Flows refused at the depth limit.
    pub depth_exceeded: usize,
    /// Flows whose performer failed.
    pub performer_failures: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ActionPayload;

    #[derive(Debug)]
    struct Draw;
    impl ActionPayload for Draw {}

    fn entry(error: Option<&ReactorError>) -> AuditEntry {
        let action = Action::new(Draw);
        AuditEntry::new(&action, Some(action.identity()), 1, Utc::now(), error.is_none(), error)
    }

    #[test]
    fn test_record_evicts_oldest_beyond_capacity() {
        let log = FlowAuditLog::new(2);
        log.record(entry(None));
        log.record(entry(None));
        log.record(entry(Some(&ReactorError::RunnerStopped)));

        assert_eq!(log.len(), 2);
        let recent = log.recent(1);
        assert_eq!(recent[0].abort_reason, Some(AbortReason::Other));
    }

    #[test]
    fn test_zero_capacity_disables_log() {
        let log = FlowAuditLog::new(0);
        log.record(entry(None));
        assert!(log.is_empty());
    }

    #[test]
    fn test_stats_classify_aborts() {
        let log = FlowAuditLog::default();
        log.record(entry(None));
        log.record(entry(Some(&ReactorError::CycleDetected {
            kind: "Draw",
            chain: vec!["Draw"],
            cycle: vec!["Draw", "Draw"],
        })));
        log.record(entry(Some(&ReactorError::DepthExceeded {
            kind: "Draw",
            depth: 3,
            max: 3,
        })));
        log.record(entry(Some(&ReactorError::PerformerFailed {
            kind: "Draw",
            message: "deck empty".into(),
        })));
        log.record(entry(Some(&ReactorError::IdentityFailed {
            kind: "Draw",
            message: "bad lineage".into(),
        })));

        let stats = log.stats();
        assert_eq!(stats.total_flows, 5);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.depth_exceeded, 1);
        assert_eq!(stats.performer_failures, 1);
        assert_eq!(log.aborted().len(), 4);
        assert_eq!(log.recent(1)[0].abort_reason, Some(AbortReason::Identity));

        log.clear();
        assert!(log.is_empty());
    }
}
