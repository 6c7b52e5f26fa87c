//! The dialogue-insertion decision table.
//!
//! A symbolic, priority-ordered table over the affordance labels plus one
//! bit of per-chapter state (`last_inserted`, the cooldown flag). Each
//! fired branch appends to an ordered reason trace so the decision can be
//! reconstructed from the audit log alone.
//!
//! Only the final fallback consults the judgment service; its failure mode
//! is the documented `UNDECIDED_FAILSAFE` (no insertion).

use crate::judge::JudgmentService;
use crate::labels::{AffordanceLabels, InfoValue, Intensity, Pacing, Presence};
use crate::story::NarrativePoint;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Reason-trace codes, stable across releases so traces stay auditable.
pub const PRESENCE_VETO: &str = "PRESENCE_VETO";
pub const INTENSITY_HARD_TRIGGER: &str = "INTENSITY_HARD_TRIGGER";
pub const COOLDOWN_SUPPRESSED: &str = "COOLDOWN_SUPPRESSED";
pub const COOLDOWN_OVERRIDDEN: &str = "COOLDOWN_OVERRIDDEN_BY_PACING";
pub const QUORUM_PASS: &str = "QUORUM_PASS";
pub const QUORUM_SHORT: &str = "QUORUM_SHORT";
pub const INFO_TIEBREAK_INSERT: &str = "INFO_TIEBREAK_INSERT";
pub const INFO_TIEBREAK_SKIP: &str = "INFO_TIEBREAK_SKIP";
pub const JUDGE_FALLBACK_YES: &str = "JUDGE_FALLBACK_YES";
pub const JUDGE_FALLBACK_NO: &str = "JUDGE_FALLBACK_NO";
pub const UNDECIDED_FAILSAFE: &str = "UNDECIDED_FAILSAFE";

/// The outcome for one narrative point: insert or not, with the label
/// snapshot and the ordered trace of fired branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertionDecision {
    pub need: bool,
    /// Snapshot of the labels the decision was made from.
    pub labels: AffordanceLabels,
    /// Ordered reason trace; the last entry is the terminal branch.
    pub reasons: Vec<String>,
}

impl InsertionDecision {
    /// The terminal branch code (the rule that decided).
    pub fn fired_rule(&self) -> &str {
        self.reasons
            .last()
            .map(String::as_str)
            .unwrap_or(UNDECIDED_FAILSAFE)
    }
}

/// Evaluates the insertion decision table for narrative points.
///
/// Stateless: the cooldown flag is owned by the run context and passed in,
/// and the caller commits the updated flag in point order after each
/// decision.
pub struct DialogueInsertionDecider {
    judge: Arc<dyn JudgmentService>,
}

impl DialogueInsertionDecider {
    pub fn new(judge: Arc<dyn JudgmentService>) -> Self {
        Self { judge }
    }

    /// Decide whether to insert a dialogue exchange at this point.
    pub async fn decide(
        &self,
        point: &NarrativePoint,
        labels: &AffordanceLabels,
        last_inserted: bool,
    ) -> InsertionDecision {
        let mut reasons = vec![format!("labels: {}", labels.summary())];

        // 1. Presence veto, terminal.
        if labels.presence == Presence::Denied {
            reasons.push(PRESENCE_VETO.to_string());
            return self.finish(false, labels, reasons);
        }

        // 2. Hard trigger, terminal, ignores cooldown.
        if labels.intensity == Intensity::High {
            reasons.push(INTENSITY_HARD_TRIGGER.to_string());
            return self.finish(true, labels, reasons);
        }

        // 3. Cooldown, unless pacing explicitly overrides it.
        if last_inserted {
            if labels.pacing == Pacing::Encourage {
                reasons.push(COOLDOWN_OVERRIDDEN.to_string());
            } else {
                reasons.push(COOLDOWN_SUPPRESSED.to_string());
                return self.finish(false, labels, reasons);
            }
        }

        // 4. Quorum among the three boosters.
        let votes = [
            labels.intensity == Intensity::Med,
            labels.info == InfoValue::High,
            labels.pacing == Pacing::Encourage,
        ]
        .iter()
        .filter(|v| **v)
        .count();
        if votes >= 2 {
            if labels.presence != Presence::Uncertain {
                reasons.push(format!("{QUORUM_PASS}({votes}/3)"));
                return self.finish(true, labels, reasons);
            }
            reasons.push(format!("{QUORUM_SHORT}: presence UNCERTAIN blocks quorum"));
        }

        // 5. High-info / low-intensity tie-break heuristic, terminal.
        if labels.info == InfoValue::High && labels.intensity == Intensity::Low {
            if labels.pacing == Pacing::Encourage && labels.presence != Presence::Uncertain {
                reasons.push(INFO_TIEBREAK_INSERT.to_string());
                return self.finish(true, labels, reasons);
            }
            reasons.push(INFO_TIEBREAK_SKIP.to_string());
            return self.finish(false, labels, reasons);
        }

        // 6. Forced binary fallback to the judgment service.
        let question = "Should a dialogue exchange be inserted at this narrative point? \
                        Answer YES or NO.";
        let context = format!(
            "Beat: {}\nLabels: {}\nParticipants: {}",
            point.text,
            labels.summary(),
            point
                .scene_participants
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
        match self.judge.ask_binary(question, &context).await {
            Ok(true) => {
                reasons.push(JUDGE_FALLBACK_YES.to_string());
                self.finish(true, labels, reasons)
            }
            Ok(false) => {
                reasons.push(JUDGE_FALLBACK_NO.to_string());
                self.finish(false, labels, reasons)
            }
            Err(err) => {
                tracing::warn!(
                    chapter = %point.chapter_id,
                    point = point.index,
                    error = %err,
                    "insertion fallback judgment unavailable, defaulting to no insertion"
                );
                reasons.push(format!("{UNDECIDED_FAILSAFE}: {err}"));
                self.finish(false, labels, reasons)
            }
        }
    }

    fn finish(
        &self,
        need: bool,
        labels: &AffordanceLabels,
        reasons: Vec<String>,
    ) -> InsertionDecision {
        InsertionDecision {
            need,
            labels: labels.clone(),
            reasons,
        }
    }
}
