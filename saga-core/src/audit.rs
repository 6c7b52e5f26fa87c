//! Append-only audit log of engine decisions.
//!
//! Every decision record carries its full reason trace, so any outcome can
//! be reconstructed from the log alone. Records are never mutated after
//! being appended; a superseding decision is a new record tied to a new
//! event. Fail-safe substitutions get their own records naming the call
//! site and the triggering condition; nothing degrades silently.

use crate::conflict::{ConflictSignals, SeverityDecision};
use crate::consensus::ConsensusSummary;
use crate::dialogue::InsertionDecision;
use crate::labels::AffordanceLabels;
use crate::propagation::PropagationRecord;
use crate::resolution::ResolutionAction;
use crate::story::ChapterId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use uuid::Uuid;

/// Unique identifier for one audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One auditable engine event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuditEvent {
    /// Affordance labels produced for a narrative point.
    Affordance {
        chapter: ChapterId,
        point: usize,
        labels: AffordanceLabels,
    },
    /// An insertion decision, with its label snapshot and reason trace.
    Insertion {
        chapter: ChapterId,
        point: usize,
        decision: InsertionDecision,
    },
    /// Conflict signals detected for a change.
    Conflict {
        chapter: ChapterId,
        signals: ConflictSignals,
    },
    /// A severity classification, with its reason trace.
    Severity {
        chapter: ChapterId,
        decision: SeverityDecision,
    },
    /// A reconciled consensus.
    Consensus {
        chapter: ChapterId,
        summary: ConsensusSummary,
    },
    /// The resolution action taken for a change.
    Resolution {
        chapter: ChapterId,
        action: ResolutionAction,
        notes: Vec<String>,
    },
    /// A downstream chapter regeneration.
    Propagation { record: PropagationRecord },
    /// A fail-safe default was substituted somewhere.
    FailSafe {
        call_site: String,
        condition: String,
    },
    /// A chapter was halted for human attention.
    Halt { chapter: ChapterId, reason: String },
}

/// An appended, immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: RecordId,
    /// Seconds-since-epoch append time.
    pub timestamp: String,
    pub event: AuditEvent,
}

/// The append-only log for one run. Appends are cheap and thread-safe;
/// reads return clones so records can never be edited in place.
#[derive(Debug, Default)]
pub struct AuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event; returns the new record's id.
    pub fn append(&self, event: AuditEvent) -> RecordId {
        let record = AuditRecord {
            id: RecordId::new(),
            timestamp: crate::story::epoch_timestamp(),
            event,
        };
        let id = record.id;
        self.records
            .lock()
            .expect("audit lock poisoned")
            .push(record);
        id
    }

    /// A copy of every record, in append order.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().expect("audit lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("audit lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fail-safe substitutions recorded.
    pub fn fail_safe_count(&self) -> usize {
        self.records()
            .iter()
            .filter(|r| matches!(r.event, AuditEvent::FailSafe { .. }))
            .count()
    }

    /// Chapters that were halted, in order.
    pub fn halts(&self) -> Vec<ChapterId> {
        self.records()
            .iter()
            .filter_map(|r| match &r.event {
                AuditEvent::Halt { chapter, .. } => Some(chapter.clone()),
                _ => None,
            })
            .collect()
    }
}
