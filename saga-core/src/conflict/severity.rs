//! The ordinal severity ladder and the signal → severity decision table.
//!
//! Severity is classified without numeric thresholds: a fixed table maps
//! signal combinations to candidate levels and the final level is the
//! maximum matched candidate. The only movement afterwards is an explicit,
//! logged one-step demotion when the judgment service confirms the
//! conflict is fixable by a local rewrite. A failed call keeps the
//! original level.

use super::signals::ConflictSignals;
use crate::judge::JudgmentService;
use serde::{Deserialize, Serialize};

/// How serious a detected conflict is. Ordinal: NONE < LOW < MEDIUM <
/// HIGH < CRITICAL.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SeverityLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl SeverityLevel {
    /// The complete ladder, lowest first.
    pub fn variants() -> &'static [&'static str] {
        &["NONE", "LOW", "MEDIUM", "HIGH", "CRITICAL"]
    }

    /// The canonical wire label for this level.
    pub fn label(&self) -> &'static str {
        match self {
            SeverityLevel::None => "NONE",
            SeverityLevel::Low => "LOW",
            SeverityLevel::Medium => "MEDIUM",
            SeverityLevel::High => "HIGH",
            SeverityLevel::Critical => "CRITICAL",
        }
    }

    /// Parse a wire label leniently (trimmed, case-insensitive).
    pub fn parse_label(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "NONE" => Some(SeverityLevel::None),
            "LOW" => Some(SeverityLevel::Low),
            "MEDIUM" => Some(SeverityLevel::Medium),
            "HIGH" => Some(SeverityLevel::High),
            "CRITICAL" => Some(SeverityLevel::Critical),
            _ => None,
        }
    }

    /// Ordinal index on the ladder (NONE = 0 … CRITICAL = 4).
    pub fn index(&self) -> usize {
        match self {
            SeverityLevel::None => 0,
            SeverityLevel::Low => 1,
            SeverityLevel::Medium => 2,
            SeverityLevel::High => 3,
            SeverityLevel::Critical => 4,
        }
    }

    /// The level at the given ordinal index.
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(SeverityLevel::None),
            1 => Some(SeverityLevel::Low),
            2 => Some(SeverityLevel::Medium),
            3 => Some(SeverityLevel::High),
            4 => Some(SeverityLevel::Critical),
            _ => None,
        }
    }

    /// One step down the ladder, saturating at NONE.
    pub fn demoted(&self) -> Self {
        Self::from_index(self.index().saturating_sub(1)).unwrap_or(SeverityLevel::None)
    }
}

/// The classified severity for one change, with the ordered reason trace
/// and the signals it was derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityDecision {
    pub level: SeverityLevel,
    /// Ordered reason trace: one entry per matched rule, plus any
    /// refinement step.
    pub reasons: Vec<String>,
    /// The originating signal set.
    pub signals: ConflictSignals,
}

/// Maps conflict signals onto the severity ladder.
#[derive(Debug, Clone, Default)]
pub struct SeverityClassifier;

impl SeverityClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Pure decision table: candidates accumulate, final = max matched.
    pub fn classify(&self, signals: &ConflictSignals) -> SeverityDecision {
        let mut reasons = Vec::new();

        // Spoilers short-circuit: CRITICAL, no further candidates and no
        // refinement ever.
        if signals.spoiler_leak {
            reasons.push("spoiler_leak => CRITICAL (terminal)".to_string());
            return SeverityDecision {
                level: SeverityLevel::Critical,
                reasons,
                signals: signals.clone(),
            };
        }

        let mut level = SeverityLevel::None;
        let mut candidate = |reasons: &mut Vec<String>, matched: SeverityLevel, rule: &str| {
            reasons.push(format!("{rule} => {} candidate", matched.label()));
            if matched > level {
                level = matched;
            }
        };

        if signals.temporal_violation && !signals.fixable_by_rewrite {
            candidate(
                &mut reasons,
                SeverityLevel::High,
                "temporal_violation without rewrite fix",
            );
        }
        if signals.memory_inconsistency && signals.scope_cross_chapter {
            candidate(
                &mut reasons,
                SeverityLevel::High,
                "memory_inconsistency across chapters",
            );
        }
        if signals.world_fact_contradiction {
            candidate(&mut reasons, SeverityLevel::Medium, "world_fact_contradiction");
        }
        if signals.memory_inconsistency && !signals.scope_cross_chapter {
            candidate(
                &mut reasons,
                SeverityLevel::Medium,
                "memory_inconsistency within chapter",
            );
        }
        if signals.local_coherence_issue || signals.redundancy_minor {
            candidate(&mut reasons, SeverityLevel::Low, "structural issue");
        }

        if reasons.is_empty() {
            reasons.push("no signals matched => NONE".to_string());
        }

        SeverityDecision {
            level,
            reasons,
            signals: signals.clone(),
        }
    }

    /// Classify, then refine MEDIUM/HIGH through a binary "fixable by
    /// local rewrite?" judgment. YES demotes exactly one level; a failed
    /// call keeps the original level and logs the kept severity; there is
    /// no silent downgrade path.
    pub async fn classify_refined(
        &self,
        signals: &ConflictSignals,
        judge: &dyn JudgmentService,
    ) -> SeverityDecision {
        let mut decision = self.classify(signals);

        if !matches!(decision.level, SeverityLevel::Medium | SeverityLevel::High) {
            return decision;
        }

        let question = "Can this conflict be repaired by a local rewrite without \
                        losing the conflicting information? Answer YES or NO.";
        let context = format!(
            "Severity so far: {}\nEvidence:\n{}",
            decision.level.label(),
            decision
                .signals
                .evidence
                .iter()
                .map(|(k, v)| format!("- {k}: {v}"))
                .collect::<Vec<_>>()
                .join("\n")
        );

        match judge.ask_binary(question, &context).await {
            Ok(true) => {
                let demoted = decision.level.demoted();
                decision.reasons.push(format!(
                    "fixable-by-rewrite confirmed: demoted {} => {}",
                    decision.level.label(),
                    demoted.label()
                ));
                decision.level = demoted;
            }
            Ok(false) => {
                decision
                    .reasons
                    .push("fixable-by-rewrite denied: severity kept".to_string());
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    level = decision.level.label(),
                    "fixable refinement unavailable, keeping severity"
                );
                decision.reasons.push(format!(
                    "refinement unavailable ({err}): severity kept at {}",
                    decision.level.label()
                ));
            }
        }

        decision
    }
}
