//! Dialogue insertion: affordance classification and the insertion decider.
//!
//! During drafting, every narrative point passes through two steps:
//! classification (an external judgment about whether the beat affords an
//! exchange) and decision (a symbolic table that combines the labels with
//! per-chapter cooldown state). Classification may degrade to fail-safe
//! labels; the decision table itself never fails.

mod affordance;
mod decider;

pub use affordance::{AffordanceClassifier, ClassifiedAffordance};
pub use decider::{
    DialogueInsertionDecider, InsertionDecision, COOLDOWN_OVERRIDDEN, COOLDOWN_SUPPRESSED,
    INFO_TIEBREAK_INSERT, INFO_TIEBREAK_SKIP, INTENSITY_HARD_TRIGGER, JUDGE_FALLBACK_NO,
    JUDGE_FALLBACK_YES, PRESENCE_VETO, QUORUM_PASS, QUORUM_SHORT, UNDECIDED_FAILSAFE,
};
