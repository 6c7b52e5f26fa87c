//! Consensus: reconciling several independent judgments into one decision.
//!
//! Two procedures share the vote/result machinery: binary consensus over
//! yes/no votes and ordinal consensus over severity votes. Confidence is a
//! comparative weight, not a tuned threshold; procedures compare sums,
//! they never test against cutoffs. Quorum is computed and reported but is
//! advisory only: a result below quorum is still a result.

use crate::conflict::SeverityLevel;
use crate::judge::JudgmentService;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Weight comparisons treat differences below this as equal.
const WEIGHT_EPSILON: f32 = 1e-6;

/// Errors from consensus procedures.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// A result must cite at least one contributing vote.
    #[error("consensus requires at least one vote")]
    NoVotes,
}

/// Renders a vote label for tallies and audit summaries.
pub trait VoteLabel: Clone + PartialEq {
    fn text(&self) -> String;
}

impl VoteLabel for bool {
    fn text(&self) -> String {
        if *self { "YES".to_string() } else { "NO".to_string() }
    }
}

impl VoteLabel for SeverityLevel {
    fn text(&self) -> String {
        self.label().to_string()
    }
}

/// One assessor's judgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote<L> {
    pub voter_id: String,
    pub label: L,
    /// Comparative weight relative to the other votes.
    pub confidence: f32,
    pub rationale: String,
}

impl<L> Vote<L> {
    pub fn new(voter_id: impl Into<String>, label: L, confidence: f32) -> Self {
        Self {
            voter_id: voter_id.into(),
            label,
            confidence,
            rationale: String::new(),
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }
}

/// A yes/no vote.
pub type BinaryVote = Vote<bool>;

/// A severity-ladder vote.
pub type SeverityVote = Vote<SeverityLevel>;

/// How a consensus was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionMethod {
    Weighted,
    Count,
    TieBreak,
    WeightedAverage,
    FixableLower,
    FixableHigher,
}

impl ResolutionMethod {
    pub fn name(&self) -> &'static str {
        match self {
            ResolutionMethod::Weighted => "weighted",
            ResolutionMethod::Count => "count",
            ResolutionMethod::TieBreak => "tie-break",
            ResolutionMethod::WeightedAverage => "weighted-average",
            ResolutionMethod::FixableLower => "fixable-lower",
            ResolutionMethod::FixableHigher => "fixable-higher",
        }
    }
}

/// The reconciled decision, with everything needed for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult<L> {
    pub final_label: L,
    pub method: ResolutionMethod,
    /// Label text → summed weight.
    pub tally: BTreeMap<String, f32>,
    /// The contributing votes. Never empty.
    pub votes: Vec<Vote<L>>,
    /// Votes on the winning side.
    pub winning_votes: usize,
    /// The advisory quorum requirement.
    pub quorum: usize,
    /// Advisory only: a false value never invalidates the result.
    pub met_quorum: bool,
}

/// Flattened consensus facts for the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSummary {
    pub final_label: String,
    pub method: String,
    pub winning_votes: usize,
    pub quorum: usize,
    pub met_quorum: bool,
    pub voters: Vec<String>,
}

impl<L: VoteLabel> ConsensusResult<L> {
    /// Flatten for the audit log.
    pub fn summary(&self) -> ConsensusSummary {
        ConsensusSummary {
            final_label: self.final_label.text(),
            method: self.method.name().to_string(),
            winning_votes: self.winning_votes,
            quorum: self.quorum,
            met_quorum: self.met_quorum,
            voters: self.votes.iter().map(|v| v.voter_id.clone()).collect(),
        }
    }
}

/// Reconciles independent votes, delegating dead ties to the judgment
/// service.
pub struct ConsensusEngine {
    judge: Arc<dyn JudgmentService>,
    /// Advisory minimum votes on the winning side.
    quorum: usize,
}

impl ConsensusEngine {
    pub fn new(judge: Arc<dyn JudgmentService>) -> Self {
        Self { judge, quorum: 1 }
    }

    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum = quorum;
        self
    }

    /// Binary consensus: weight, then count, then tie-break.
    ///
    /// A failed tie-break call defaults to NO (the conservative answer for
    /// every binary question this engine asks).
    pub async fn binary(
        &self,
        votes: Vec<BinaryVote>,
    ) -> Result<ConsensusResult<bool>, ConsensusError> {
        if votes.is_empty() {
            return Err(ConsensusError::NoVotes);
        }

        let yes_weight: f32 = votes.iter().filter(|v| v.label).map(|v| v.confidence).sum();
        let no_weight: f32 = votes.iter().filter(|v| !v.label).map(|v| v.confidence).sum();
        let yes_count = votes.iter().filter(|v| v.label).count();
        let no_count = votes.len() - yes_count;

        let mut tally = BTreeMap::new();
        tally.insert("YES".to_string(), yes_weight);
        tally.insert("NO".to_string(), no_weight);

        let (final_label, method) = if (yes_weight - no_weight).abs() > WEIGHT_EPSILON {
            (yes_weight > no_weight, ResolutionMethod::Weighted)
        } else if yes_count != no_count {
            (yes_count > no_count, ResolutionMethod::Count)
        } else {
            let question = "Independent assessors are evenly split. Decide the \
                            question they voted on. Answer YES or NO.";
            let context = render_rationales(&votes);
            let label = match self.judge.ask_binary(question, &context).await {
                Ok(answer) => answer,
                Err(err) => {
                    tracing::warn!(error = %err, "binary tie-break unavailable, defaulting NO");
                    false
                }
            };
            (label, ResolutionMethod::TieBreak)
        };

        let winning_votes = votes.iter().filter(|v| v.label == final_label).count();
        Ok(ConsensusResult {
            final_label,
            method,
            tally,
            winning_votes,
            quorum: self.quorum,
            met_quorum: winning_votes >= self.quorum,
            votes,
        })
    }

    /// Ordinal severity consensus via confidence-weighted average index.
    ///
    /// The candidate set is {round, floor, ceil} of the average,
    /// intersected with the ladder. Ties fall through the `fixable` hint
    /// to a judgment-service pick; a failed pick takes the highest (most
    /// conservative) candidate.
    pub async fn severity(
        &self,
        votes: Vec<SeverityVote>,
        fixable: Option<bool>,
    ) -> Result<ConsensusResult<SeverityLevel>, ConsensusError> {
        if votes.is_empty() {
            return Err(ConsensusError::NoVotes);
        }

        let total_weight: f32 = votes.iter().map(|v| v.confidence).sum();
        let average = if total_weight > WEIGHT_EPSILON {
            votes
                .iter()
                .map(|v| v.label.index() as f32 * v.confidence)
                .sum::<f32>()
                / total_weight
        } else {
            votes.iter().map(|v| v.label.index() as f32).sum::<f32>() / votes.len() as f32
        };

        let mut candidates: Vec<SeverityLevel> = [
            average.round() as isize,
            average.floor() as isize,
            average.ceil() as isize,
        ]
        .into_iter()
        .filter(|i| (0..=4).contains(i))
        .filter_map(|i| SeverityLevel::from_index(i as usize))
        .collect();
        candidates.sort();
        candidates.dedup();

        let mut tally = BTreeMap::new();
        for vote in &votes {
            *tally.entry(vote.label.text()).or_insert(0.0) += vote.confidence;
        }

        // The ladder bounds the average, so the candidate set is never
        // empty; the conservative fallback is the highest candidate.
        let highest = candidates
            .last()
            .copied()
            .unwrap_or(SeverityLevel::Critical);

        let (final_label, method) = if candidates.len() == 1 {
            (candidates[0], ResolutionMethod::WeightedAverage)
        } else {
            match fixable {
                Some(true) => (candidates[0], ResolutionMethod::FixableLower),
                Some(false) => (highest, ResolutionMethod::FixableHigher),
                None => {
                    let options: Vec<String> =
                        candidates.iter().map(|c| c.label().to_string()).collect();
                    let question = "Independent assessors produced a severity tie. \
                                    Pick the level that best fits the evidence.";
                    let context = render_rationales(&votes);
                    let picked = match self.judge.choose(question, &options, &context).await {
                        Ok(choice) => SeverityLevel::parse_label(&choice),
                        Err(err) => {
                            tracing::warn!(
                                error = %err,
                                "severity tie-break unavailable, taking highest candidate"
                            );
                            None
                        }
                    };
                    (picked.unwrap_or(highest), ResolutionMethod::TieBreak)
                }
            }
        };

        let winning_votes = votes.iter().filter(|v| v.label == final_label).count();
        Ok(ConsensusResult {
            final_label,
            method,
            tally,
            winning_votes,
            quorum: self.quorum,
            met_quorum: winning_votes >= self.quorum,
            votes,
        })
    }
}

fn render_rationales<L: VoteLabel>(votes: &[Vote<L>]) -> String {
    votes
        .iter()
        .map(|v| {
            format!(
                "- {} voted {} (weight {:.2}): {}",
                v.voter_id,
                v.label.text(),
                v.confidence,
                v.rationale
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
