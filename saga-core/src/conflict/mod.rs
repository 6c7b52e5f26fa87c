//! Conflict detection and severity classification for chapter edits.
//!
//! An upstream [`ChangeEvent`](crate::story::ChangeEvent) is first turned
//! into a fixed set of boolean signals (rule-based, with an optional
//! judgment-service assist for the soft coherence checks), then the signals
//! are mapped onto the ordinal severity ladder by a decision table.

mod severity;
mod signals;

pub use severity::{SeverityClassifier, SeverityDecision, SeverityLevel};
pub use signals::{ConflictSignalDetector, ConflictSignals};
