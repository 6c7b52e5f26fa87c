//! The consistency engine: the public API tying the components together.
//!
//! Two independent flows share the engine:
//! - drafting: narrative point → affordance labels → insertion decision,
//!   with cooldown committed strictly in point order within a chapter and
//!   free concurrency across chapters;
//! - change assessment: change event → conflict signals → severity (with
//!   optional multi-assessor consensus) → resolution → one-hop
//!   propagation, under the chapter's assessment lock.
//!
//! All cross-call state lives in the caller-owned [`RunContext`]; the
//! engine itself is immutable after construction and safe to share.

use crate::audit::AuditEvent;
use crate::conflict::{ConflictSignalDetector, SeverityClassifier, SeverityDecision, ConflictSignals};
use crate::consensus::{ConsensusEngine, ConsensusSummary, SeverityVote};
use crate::context::RunContext;
use crate::dependency::{DependencyEdge, DependencyTracker};
use crate::dialogue::{AffordanceClassifier, DialogueInsertionDecider, InsertionDecision};
use crate::hooks::Stage;
use crate::judge::{ContentService, JudgmentService};
use crate::propagation::{PropagationCoordinator, PropagationRecord};
use crate::resolution::{chapter_key, ChapterState, ResolutionAction, ResolutionStrategy};
use crate::store::{StateStore, StoreError};
use crate::story::{ChangeEvent, ChapterId, NarrativePoint, SceneContext, Story};
use futures::future::join_all;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

/// Errors from engine entry points.
///
/// Service failures never surface here; they degrade to documented
/// fail-safes inside the decision tables. What remains is caller error
/// (unknown or blocked chapters) and persistence failure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown chapter: {0}")]
    UnknownChapter(ChapterId),

    #[error("chapter {0} is blocked pending manual clearance")]
    ChapterBlocked(ChapterId),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

/// Engine tuning. No numeric thresholds: these are structural knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Independent severity assessments reconciled by consensus. 1 skips
    /// consensus entirely.
    pub independent_assessors: usize,

    /// Advisory quorum reported by consensus results.
    pub quorum: usize,

    /// Whether conflict detection adds the judgment-service coherence
    /// assist on top of the rule pass.
    pub judged_coherence: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            independent_assessors: 1,
            quorum: 1,
            judged_coherence: false,
        }
    }
}

/// Everything that happened while assessing one change event.
#[derive(Debug, Clone)]
pub struct ChangeOutcome {
    pub signals: ConflictSignals,
    pub severity: SeverityDecision,
    /// Present when multiple assessors were reconciled.
    pub consensus: Option<ConsensusSummary>,
    pub action: ResolutionAction,
    /// Execution notes from the resolution.
    pub notes: Vec<String>,
    pub edges: BTreeSet<DependencyEdge>,
    pub propagated: Vec<PropagationRecord>,
    pub halted: bool,
    /// A chapter flagged for regeneration after rollback.
    pub regenerate: Option<ChapterId>,
}

/// The narrative consistency and conflict-resolution engine.
pub struct ConsistencyEngine {
    judge: Arc<dyn JudgmentService>,
    config: EngineConfig,
    affordance: AffordanceClassifier,
    decider: DialogueInsertionDecider,
    detector: ConflictSignalDetector,
    classifier: SeverityClassifier,
    consensus: ConsensusEngine,
    tracker: DependencyTracker,
    strategy: ResolutionStrategy,
    coordinator: PropagationCoordinator,
    store: Arc<dyn StateStore>,
}

impl ConsistencyEngine {
    pub fn new(
        judge: Arc<dyn JudgmentService>,
        content: Arc<dyn ContentService>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let config = EngineConfig::default();
        Self {
            affordance: AffordanceClassifier::new(judge.clone()),
            decider: DialogueInsertionDecider::new(judge.clone()),
            detector: ConflictSignalDetector::new(),
            classifier: SeverityClassifier::new(),
            consensus: ConsensusEngine::new(judge.clone()).with_quorum(config.quorum),
            tracker: DependencyTracker::new(),
            strategy: ResolutionStrategy::new(content.clone(), store.clone()),
            coordinator: PropagationCoordinator::new(content),
            judge,
            config,
            store,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.consensus = ConsensusEngine::new(self.judge.clone()).with_quorum(config.quorum);
        self.config = config;
        self
    }

    /// Reset per-chapter drafting state at a chapter boundary.
    pub fn begin_chapter(&self, ctx: &RunContext, chapter: &ChapterId) {
        ctx.begin_chapter(chapter);
    }

    /// Clear a halted chapter back to CLEAN. Returns false if the chapter
    /// was not blocked.
    pub fn clear_halt(&self, ctx: &RunContext, chapter: &ChapterId) -> bool {
        ctx.clear_halt(chapter)
    }

    /// Decide dialogue insertion for one narrative point and commit the
    /// cooldown flag. Points of one chapter must pass through here in
    /// point order.
    pub async fn decide_dialogue(
        &self,
        ctx: &RunContext,
        point: &NarrativePoint,
    ) -> InsertionDecision {
        let meta = json!({
            "chapter": point.chapter_id.as_str(),
            "point": point.index,
        });

        ctx.stage_start(Stage::Affordance, &meta);
        let classified = self.affordance.classify(point).await;
        for substitution in &classified.substitutions {
            ctx.audit.append(AuditEvent::FailSafe {
                call_site: "affordance".to_string(),
                condition: substitution.clone(),
            });
        }
        ctx.audit.append(AuditEvent::Affordance {
            chapter: point.chapter_id.clone(),
            point: point.index,
            labels: classified.labels.clone(),
        });
        ctx.stage_end(Stage::Affordance, &meta);

        ctx.stage_start(Stage::InsertionDecision, &meta);
        let last_inserted = ctx.last_inserted(&point.chapter_id);
        let decision = self
            .decider
            .decide(point, &classified.labels, last_inserted)
            .await;
        if decision
            .fired_rule()
            .starts_with(crate::dialogue::UNDECIDED_FAILSAFE)
        {
            ctx.audit.append(AuditEvent::FailSafe {
                call_site: "insertion-decider".to_string(),
                condition: decision.fired_rule().to_string(),
            });
        }
        ctx.set_last_inserted(&point.chapter_id, decision.need);
        ctx.audit.append(AuditEvent::Insertion {
            chapter: point.chapter_id.clone(),
            point: point.index,
            decision: decision.clone(),
        });
        ctx.stage_end(Stage::InsertionDecision, &meta);

        decision
    }

    /// Decide a whole chapter's points in order, resetting cooldown at
    /// the chapter boundary first.
    pub async fn decide_chapter(
        &self,
        ctx: &RunContext,
        points: &[NarrativePoint],
    ) -> Vec<InsertionDecision> {
        if let Some(first) = points.first() {
            ctx.begin_chapter(&first.chapter_id);
        }

        let mut decisions = Vec::with_capacity(points.len());
        for point in points {
            decisions.push(self.decide_dialogue(ctx, point).await);
        }
        decisions
    }

    /// Decide several chapters concurrently. Points within each chapter
    /// stay strictly ordered; chapters proceed independently because
    /// cooldown state is per-chapter.
    pub async fn decide_chapters(
        &self,
        ctx: &RunContext,
        chapters: &[Vec<NarrativePoint>],
    ) -> Vec<Vec<InsertionDecision>> {
        join_all(
            chapters
                .iter()
                .map(|points| self.decide_chapter(ctx, points)),
        )
        .await
    }

    /// Assess one change event end to end: detect, classify, resolve,
    /// propagate. Holds the chapter's assessment lock for the whole span
    /// so overlapping change events serialize.
    pub async fn assess_change(
        &self,
        ctx: &RunContext,
        story: &mut Story,
        event: ChangeEvent,
        scene: &SceneContext,
    ) -> Result<ChangeOutcome, EngineError> {
        if story.get(&event.chapter_id).is_none() {
            return Err(EngineError::UnknownChapter(event.chapter_id.clone()));
        }
        if ctx.is_blocked(&event.chapter_id) {
            return Err(EngineError::ChapterBlocked(event.chapter_id.clone()));
        }

        let lock = ctx.chapter_lock(&event.chapter_id);
        let _guard = lock.lock().await;
        ctx.set_state(&event.chapter_id, ChapterState::Assessing);

        // Capture the pre-change state so HIGH severity can roll back to
        // the snapshot preceding this event.
        let key = chapter_key(&event.chapter_id);
        self.store
            .set(&key, json!(event.previous_content), None)
            .await?;
        let snapshot = self
            .store
            .snapshot(&format!("pre-change {}", event.chapter_id))
            .await?;
        self.store.set(&key, json!(event.new_content), None).await?;

        // The story reflects the edit while it is being assessed.
        if let Some(chapter) = story.get_mut(&event.chapter_id) {
            chapter.content = event.new_content.clone();
        }

        let meta = json!({ "chapter": event.chapter_id.as_str(), "cause": event.cause });

        ctx.stage_start(Stage::ConflictDetection, &meta);
        let signals = if self.config.judged_coherence {
            self.detector
                .detect_with_judge(&event, scene, story, self.judge.as_ref())
                .await
        } else {
            self.detector.detect(&event, scene, story)
        };
        ctx.audit.append(AuditEvent::Conflict {
            chapter: event.chapter_id.clone(),
            signals: signals.clone(),
        });
        ctx.stage_end(Stage::ConflictDetection, &meta);

        ctx.stage_start(Stage::SeverityClassification, &meta);
        let (severity, consensus) = self.classify_severity(ctx, &event, &signals).await;
        ctx.audit.append(AuditEvent::Severity {
            chapter: event.chapter_id.clone(),
            decision: severity.clone(),
        });
        ctx.stage_end(Stage::SeverityClassification, &meta);

        ctx.stage_start(Stage::Resolution, &meta);
        let resolution = self
            .strategy
            .execute(ctx, story, &event, &severity, Some(snapshot))
            .await;
        ctx.audit.append(AuditEvent::Resolution {
            chapter: event.chapter_id.clone(),
            action: resolution.action,
            notes: resolution.notes.clone(),
        });
        ctx.stage_end(Stage::Resolution, &meta);

        // HALT cancels all propagation scheduled downstream of this
        // chapter for the current run.
        let (edges, propagated) = if resolution.halted {
            (BTreeSet::new(), Vec::new())
        } else {
            ctx.stage_start(Stage::Propagation, &meta);
            let edges = self.tracker.scan(story, &event);
            let propagated = self
                .coordinator
                .propagate(ctx, story, &event, &edges)
                .await;
            ctx.stage_end(Stage::Propagation, &meta);
            ctx.set_state(&event.chapter_id, ChapterState::Clean);
            (edges, propagated)
        };

        Ok(ChangeOutcome {
            signals,
            severity,
            consensus,
            action: resolution.action,
            notes: resolution.notes,
            edges,
            propagated,
            halted: resolution.halted,
            regenerate: resolution.regenerate,
        })
    }

    /// Single assessment, or N independent assessments reconciled by
    /// ordinal consensus.
    async fn classify_severity(
        &self,
        ctx: &RunContext,
        event: &ChangeEvent,
        signals: &ConflictSignals,
    ) -> (SeverityDecision, Option<ConsensusSummary>) {
        let assessors = self.config.independent_assessors.max(1);
        if assessors == 1 {
            return (
                self.classifier
                    .classify_refined(signals, self.judge.as_ref())
                    .await,
                None,
            );
        }

        let mut votes = Vec::with_capacity(assessors);
        let mut decisions = Vec::with_capacity(assessors);
        for n in 0..assessors {
            let decision = self
                .classifier
                .classify_refined(signals, self.judge.as_ref())
                .await;
            votes.push(
                SeverityVote::new(format!("assessor-{n}"), decision.level, 1.0)
                    .with_rationale(decision.reasons.join("; ")),
            );
            decisions.push(decision);
        }

        let fixable = signals.fixable_by_rewrite.then_some(true);
        let meta = json!({ "chapter": event.chapter_id.as_str(), "assessors": assessors });
        ctx.stage_start(Stage::Consensus, &meta);
        let reconciled = match self.consensus.severity(votes, fixable).await {
            Ok(result) => result,
            Err(_) => {
                // Unreachable with assessors >= 2, but degrade to the
                // first assessment rather than panic.
                ctx.stage_end(Stage::Consensus, &meta);
                return (decisions.remove(0), None);
            }
        };
        let summary = reconciled.summary();
        ctx.audit.append(AuditEvent::Consensus {
            chapter: event.chapter_id.clone(),
            summary: summary.clone(),
        });
        ctx.stage_end(Stage::Consensus, &meta);

        let mut reasons: Vec<String> = decisions
            .first()
            .map(|d| d.reasons.clone())
            .unwrap_or_default();
        reasons.push(format!(
            "consensus over {} assessors: {} via {}",
            assessors, summary.final_label, summary.method
        ));

        (
            SeverityDecision {
                level: reconciled.final_label,
                reasons,
                signals: signals.clone(),
            },
            Some(summary),
        )
    }
}
