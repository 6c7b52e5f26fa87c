//! Testing utilities for the consistency engine.
//!
//! This module provides deterministic doubles for the two external
//! services plus a harness for scripted end-to-end scenarios:
//! - `MockJudge` returns scripted judgment answers (or fails on cue)
//! - `MockContent` returns scripted or canned generated content
//! - `StoryHarness` wires a full engine over the mocks
//! - Assertion helpers for verifying engine state

use crate::context::RunContext;
use crate::engine::{ChangeOutcome, ConsistencyEngine, EngineError};
use crate::judge::{
    ChapterSpec, ContentService, JudgmentRequest, JudgmentResponse, JudgmentService, ServiceError,
};
use crate::resolution::ChapterState;
use crate::store::MemoryStore;
use crate::story::{ChangeEvent, ChapterId, DialogueLine, SceneContext, Story};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// A judgment service that returns scripted answers in order.
///
/// Every queue is independent; an exhausted queue answers
/// `ServiceError::Unavailable`, which doubles as the "service down" mode.
#[derive(Default)]
pub struct MockJudge {
    judgments: Mutex<VecDeque<Result<JudgmentResponse, ServiceError>>>,
    binaries: Mutex<VecDeque<Result<bool, ServiceError>>>,
    choices: Mutex<VecDeque<Result<String, ServiceError>>>,
    judgment_count: AtomicU32,
    binary_count: AtomicU32,
    choice_count: AtomicU32,
}

impl MockJudge {
    /// A judge with nothing scripted: every call fails as unavailable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads better in tests that exercise fail-safe paths.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Queue a multi-field judgment answer.
    pub fn queue_labels<'a>(&self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) {
        let mut response = JudgmentResponse::default();
        for (key, value) in pairs {
            response.values.insert(key.to_string(), value.to_string());
        }
        self.judgments
            .lock()
            .unwrap()
            .push_back(Ok(response));
    }

    /// Queue a judgment failure.
    pub fn queue_judgment_failure(&self) {
        self.judgments
            .lock()
            .unwrap()
            .push_back(Err(ServiceError::Unavailable("scripted failure".to_string())));
    }

    /// Queue a yes/no answer.
    pub fn queue_binary(&self, answer: bool) {
        self.binaries.lock().unwrap().push_back(Ok(answer));
    }

    /// Queue a yes/no failure.
    pub fn queue_binary_failure(&self) {
        self.binaries
            .lock()
            .unwrap()
            .push_back(Err(ServiceError::Unavailable("scripted failure".to_string())));
    }

    /// Queue a choice answer.
    pub fn queue_choice(&self, choice: &str) {
        self.choices
            .lock()
            .unwrap()
            .push_back(Ok(choice.to_string()));
    }

    pub fn judgment_calls(&self) -> u32 {
        self.judgment_count.load(Ordering::SeqCst)
    }

    pub fn binary_calls(&self) -> u32 {
        self.binary_count.load(Ordering::SeqCst)
    }

    pub fn choice_calls(&self) -> u32 {
        self.choice_count.load(Ordering::SeqCst)
    }

    fn exhausted() -> ServiceError {
        ServiceError::Unavailable("no scripted answer".to_string())
    }
}

#[async_trait]
impl JudgmentService for MockJudge {
    async fn judge(&self, _request: JudgmentRequest) -> Result<JudgmentResponse, ServiceError> {
        self.judgment_count.fetch_add(1, Ordering::SeqCst);
        self.judgments
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Self::exhausted()))
    }

    async fn ask_binary(&self, _question: &str, _context: &str) -> Result<bool, ServiceError> {
        self.binary_count.fetch_add(1, Ordering::SeqCst);
        self.binaries
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Self::exhausted()))
    }

    async fn choose(
        &self,
        _question: &str,
        options: &[String],
        _context: &str,
    ) -> Result<String, ServiceError> {
        self.choice_count.fetch_add(1, Ordering::SeqCst);
        match self.choices.lock().unwrap().pop_front() {
            Some(Ok(choice)) if options.iter().any(|o| o == &choice) => Ok(choice),
            Some(Ok(choice)) => Err(ServiceError::Malformed(format!(
                "scripted choice '{choice}' not among options"
            ))),
            Some(Err(err)) => Err(err),
            None => Err(Self::exhausted()),
        }
    }
}

/// A content service with scripted or canned responses.
pub struct MockContent {
    prose: Mutex<VecDeque<String>>,
    dialogue: Mutex<VecDeque<Vec<DialogueLine>>>,
    failing: bool,
    requests: Mutex<Vec<ChapterSpec>>,
}

impl MockContent {
    /// Canned mode: deterministic regenerated content per request.
    pub fn new() -> Self {
        Self {
            prose: Mutex::new(VecDeque::new()),
            dialogue: Mutex::new(VecDeque::new()),
            failing: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every generation call fails as unavailable.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new()
        }
    }

    /// Queue a specific prose response.
    pub fn with_prose(self, prose: impl Into<String>) -> Self {
        self.prose.lock().unwrap().push_back(prose.into());
        self
    }

    /// Queue a specific dialogue response.
    pub fn with_dialogue(self, lines: Vec<DialogueLine>) -> Self {
        self.dialogue.lock().unwrap().push_back(lines);
        self
    }

    /// Every spec this service was asked to generate, in order.
    pub fn requests(&self) -> Vec<ChapterSpec> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockContent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentService for MockContent {
    async fn generate_prose(&self, spec: &ChapterSpec) -> Result<String, ServiceError> {
        self.requests.lock().unwrap().push(spec.clone());
        if self.failing {
            return Err(ServiceError::Unavailable("scripted failure".to_string()));
        }
        Ok(self
            .prose
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| format!("Regenerated prose for {}.", spec.title)))
    }

    async fn generate_dialogue(
        &self,
        spec: &ChapterSpec,
    ) -> Result<Vec<DialogueLine>, ServiceError> {
        self.requests.lock().unwrap().push(spec.clone());
        if self.failing {
            return Err(ServiceError::Unavailable("scripted failure".to_string()));
        }
        Ok(self.dialogue.lock().unwrap().pop_front().unwrap_or_else(|| {
            let speaker = spec
                .roster
                .first()
                .cloned()
                .unwrap_or_else(|| "Narrator".to_string());
            vec![DialogueLine::new(
                speaker,
                format!("Regenerated line for {}.", spec.title),
            )]
        }))
    }
}

/// A full engine over mock services, for scripted scenarios.
pub struct StoryHarness {
    pub judge: Arc<MockJudge>,
    pub content: Arc<MockContent>,
    pub store: Arc<MemoryStore>,
    pub engine: ConsistencyEngine,
    pub ctx: RunContext,
    pub story: Story,
}

impl StoryHarness {
    /// An empty harness; add chapters through `story`.
    pub fn new() -> Self {
        Self::with_story(Story::new())
    }

    /// A harness over the given story.
    pub fn with_story(story: Story) -> Self {
        let judge = Arc::new(MockJudge::new());
        let content = Arc::new(MockContent::new());
        let store = Arc::new(MemoryStore::new());
        let engine = ConsistencyEngine::new(judge.clone(), content.clone(), store.clone());

        Self {
            judge,
            content,
            store,
            engine,
            ctx: RunContext::new(),
            story,
        }
    }

    /// Assess a change through the full pipeline.
    pub async fn assess(
        &mut self,
        event: ChangeEvent,
        scene: &SceneContext,
    ) -> Result<ChangeOutcome, EngineError> {
        self.engine
            .assess_change(&self.ctx, &mut self.story, event, scene)
            .await
    }

    /// Current content of a chapter.
    pub fn chapter_content(&self, id: &str) -> String {
        self.story
            .get(&ChapterId::new(id))
            .map(|c| c.content.clone())
            .unwrap_or_default()
    }
}

impl Default for StoryHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert a chapter's resolution state.
#[track_caller]
pub fn assert_state(harness: &StoryHarness, chapter: &str, expected: ChapterState) {
    let actual = harness.ctx.state(&ChapterId::new(chapter));
    assert_eq!(
        actual, expected,
        "expected {chapter} in state {}, got {}",
        expected.name(),
        actual.name()
    );
}

/// Assert which decision-table rule fired.
#[track_caller]
pub fn assert_fired(decision: &crate::dialogue::InsertionDecision, rule_prefix: &str) {
    assert!(
        decision.fired_rule().starts_with(rule_prefix),
        "expected rule '{rule_prefix}', got trace {:?}",
        decision.reasons
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEvent;
    use crate::conflict::SeverityLevel;
    use crate::engine::EngineConfig;
    use crate::resolution::ResolutionAction;
    use crate::story::{Chapter, EstablishedFact, FutureFact, KnowledgeRestriction, NarrativePoint};

    fn betrayal_story() -> Story {
        Story::new()
            .with_chapter(
                Chapter::new("Chapter 3", 2, "The Ford")
                    .with_content("Mira kept her silence about what happened at the ford.")
                    .with_entity("Mira"),
            )
            .with_chapter(
                Chapter::new("Chapter 4", 3, "The Road")
                    .with_content("Rain fell on the road south.")
                    .with_entity("Aldric"),
            )
            .with_chapter(
                Chapter::new("Chapter 5", 4, "The Reckoning")
                    .with_content("Before the council, Mira referenced the betrayal at the ford.")
                    .with_entity("Mira"),
            )
    }

    fn betrayal_scene() -> SceneContext {
        SceneContext::new().with_restriction(
            KnowledgeRestriction::new("Mira", "the betrayal")
                .with_phrase("the betrayal at the ford"),
        )
    }

    fn betrayal_event() -> ChangeEvent {
        ChangeEvent::new(
            "Chapter 3",
            "Mira kept her silence about what happened at the ford.",
            "Mira spoke as if she had witnessed the betrayal at the ford.",
            "operator edit",
        )
    }

    #[tokio::test]
    async fn test_memory_conflict_rolls_back_and_propagates() {
        let mut harness = StoryHarness::with_story(betrayal_story());

        let outcome = harness
            .assess(betrayal_event(), &betrayal_scene())
            .await
            .unwrap();

        // Signals: restricted knowledge surfaced, and it echoes downstream.
        assert!(outcome.signals.memory_inconsistency);
        assert!(outcome.signals.scope_cross_chapter);

        // HIGH severity (the refinement judge is unscripted, so the level
        // is kept) resolves to rollback.
        assert_eq!(outcome.severity.level, SeverityLevel::High);
        assert_eq!(outcome.action, ResolutionAction::Rollback);
        assert_eq!(outcome.regenerate, Some(ChapterId::new("Chapter 3")));
        assert_eq!(
            harness.chapter_content("Chapter 3"),
            "Mira kept her silence about what happened at the ford."
        );

        // The dependency edge 3 -> 5 over Mira, and one-hop propagation.
        assert_eq!(outcome.edges.len(), 1);
        let edge = outcome.edges.iter().next().unwrap();
        assert_eq!(edge.to_chapter, ChapterId::new("Chapter 5"));
        assert!(edge.shared_entities.contains("Mira"));

        assert_eq!(outcome.propagated.len(), 1);
        let record = &outcome.propagated[0];
        assert_eq!(record.chapter_id, ChapterId::new("Chapter 5"));
        assert!(record.plot_updated);
        assert!(record.dialogue_updated);

        // Chapter 4 shares nothing and is untouched.
        assert_eq!(harness.chapter_content("Chapter 4"), "Rain fell on the road south.");

        assert_state(&harness, "Chapter 3", ChapterState::Clean);
    }

    #[tokio::test]
    async fn test_quorum_pass_insertion_end_to_end() {
        let harness = StoryHarness::new();
        harness.judge.queue_labels([
            ("presence", "AFFIRMED"),
            ("intensity", "MED"),
            ("info", "HIGH"),
            ("pacing", "ENCOURAGE"),
        ]);

        let point = NarrativePoint::new("Chapter 1", 0, "Mira hesitated at the gate.")
            .with_participant("Mira");
        let decisions = harness.engine.decide_chapter(&harness.ctx, &[point]).await;

        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].need);
        assert_fired(&decisions[0], "QUORUM_PASS");
        assert!(harness.ctx.last_inserted(&ChapterId::new("Chapter 1")));
    }

    #[tokio::test]
    async fn test_spoiler_halts_blocks_and_clears() {
        let mut harness = StoryHarness::with_story(betrayal_story());
        let scene = SceneContext::new().with_future_fact(FutureFact::new(
            "duke-death",
            "the duke dies at the masquerade",
        ));

        let event = ChangeEvent::new(
            "Chapter 3",
            "Mira kept her silence about what happened at the ford.",
            "Mira revealed that the duke dies at the masquerade.",
            "operator edit",
        );
        let outcome = harness.assess(event, &scene).await.unwrap();

        assert!(outcome.halted);
        assert_eq!(outcome.severity.level, SeverityLevel::Critical);
        assert_eq!(outcome.action, ResolutionAction::Halt);
        assert!(outcome.edges.is_empty());
        assert!(outcome.propagated.is_empty());
        assert_state(&harness, "Chapter 3", ChapterState::Blocked);

        // Blocked chapters refuse further assessment.
        let again = ChangeEvent::new("Chapter 3", "x", "y", "retry");
        assert!(matches!(
            harness.assess(again, &scene).await,
            Err(EngineError::ChapterBlocked(_))
        ));

        // Manual clearance reopens the chapter.
        assert!(harness
            .engine
            .clear_halt(&harness.ctx, &ChapterId::new("Chapter 3")));
        let benign = ChangeEvent::new(
            "Chapter 3",
            "Mira revealed that the duke dies at the masquerade.",
            "Mira said nothing of consequence.",
            "operator fix",
        );
        let outcome = harness.assess(benign, &SceneContext::new()).await.unwrap();
        assert_eq!(outcome.action, ResolutionAction::Accept);
        assert_state(&harness, "Chapter 3", ChapterState::Clean);
    }

    #[tokio::test]
    async fn test_multi_assessor_consensus() {
        let judge = Arc::new(MockJudge::new());
        // Three assessors each get a "not fixable" refinement answer.
        judge.queue_binary(false);
        judge.queue_binary(false);
        judge.queue_binary(false);

        let content = Arc::new(MockContent::new());
        let store = Arc::new(MemoryStore::new());
        let engine = ConsistencyEngine::new(judge.clone(), content, store).with_config(
            EngineConfig {
                independent_assessors: 3,
                quorum: 2,
                judged_coherence: false,
            },
        );

        let mut story = betrayal_story();
        let ctx = RunContext::new();
        let scene = SceneContext::new().with_established_fact(
            EstablishedFact::new("The gates were sealed after dusk")
                .with_negation("the gates stood open all night"),
        );
        let event = ChangeEvent::new(
            "Chapter 3",
            "Mira kept her silence about what happened at the ford.",
            "That night the gates stood open all night.",
            "operator edit",
        );

        let outcome = engine
            .assess_change(&ctx, &mut story, event, &scene)
            .await
            .unwrap();

        assert_eq!(outcome.severity.level, SeverityLevel::Medium);
        let consensus = outcome.consensus.expect("consensus expected");
        assert_eq!(consensus.method, "weighted-average");
        assert_eq!(consensus.voters.len(), 3);
        assert!(consensus.met_quorum);
        assert_eq!(outcome.action, ResolutionAction::RewriteScene);
    }

    #[tokio::test]
    async fn test_audit_trail_reconstructs_decisions() {
        let mut harness = StoryHarness::with_story(betrayal_story());
        harness
            .assess(betrayal_event(), &betrayal_scene())
            .await
            .unwrap();

        let records = harness.ctx.audit.records();
        let mut saw_conflict = false;
        let mut saw_severity = false;
        let mut saw_resolution = false;
        let mut saw_propagation = false;
        for record in &records {
            match &record.event {
                AuditEvent::Conflict { signals, .. } => {
                    saw_conflict = true;
                    assert!(signals.memory_inconsistency);
                }
                AuditEvent::Severity { decision, .. } => {
                    saw_severity = true;
                    assert!(!decision.reasons.is_empty());
                }
                AuditEvent::Resolution { action, notes, .. } => {
                    saw_resolution = true;
                    assert_eq!(*action, ResolutionAction::Rollback);
                    assert!(!notes.is_empty());
                }
                AuditEvent::Propagation { record } => {
                    saw_propagation = true;
                    assert_eq!(record.chapter_id, ChapterId::new("Chapter 5"));
                }
                _ => {}
            }
        }
        assert!(saw_conflict && saw_severity && saw_resolution && saw_propagation);
    }

    #[tokio::test]
    async fn test_unknown_chapter_rejected() {
        let mut harness = StoryHarness::new();
        let event = ChangeEvent::new("Chapter 9", "a", "b", "edit");

        assert!(matches!(
            harness.assess(event, &SceneContext::new()).await,
            Err(EngineError::UnknownChapter(_))
        ));
    }

    #[tokio::test]
    async fn test_clean_edit_is_accepted() {
        let mut harness = StoryHarness::with_story(betrayal_story());
        let event = ChangeEvent::new(
            "Chapter 4",
            "Rain fell on the road south.",
            "Rain fell softly on the road south.",
            "style pass",
        );

        let outcome = harness.assess(event, &SceneContext::new()).await.unwrap();

        assert!(!outcome.signals.any());
        assert_eq!(outcome.severity.level, SeverityLevel::None);
        assert_eq!(outcome.action, ResolutionAction::Accept);
        assert!(outcome.propagated.is_empty());
        assert_state(&harness, "Chapter 4", ChapterState::Clean);
    }

    #[tokio::test]
    async fn test_concurrent_chapter_drafting() {
        let harness = StoryHarness::new();
        // Four points, all classified identically: hard trigger.
        for _ in 0..4 {
            harness.judge.queue_labels([
                ("presence", "AFFIRMED"),
                ("intensity", "HIGH"),
                ("info", "LOW"),
                ("pacing", "HOLD"),
            ]);
        }

        let chapters = vec![
            vec![
                NarrativePoint::new("Chapter 1", 0, "Beat one."),
                NarrativePoint::new("Chapter 1", 1, "Beat two."),
            ],
            vec![
                NarrativePoint::new("Chapter 2", 0, "Beat one."),
                NarrativePoint::new("Chapter 2", 1, "Beat two."),
            ],
        ];

        let decisions = harness.engine.decide_chapters(&harness.ctx, &chapters).await;

        assert_eq!(decisions.len(), 2);
        for chapter in &decisions {
            assert_eq!(chapter.len(), 2);
            for decision in chapter {
                assert!(decision.need);
            }
        }
    }

    #[tokio::test]
    async fn test_rollback_snapshot_in_store_history() {
        let mut harness = StoryHarness::with_story(betrayal_story());
        harness
            .assess(betrayal_event(), &betrayal_scene())
            .await
            .unwrap();

        let history = harness.store.snapshot_history();
        assert_eq!(history.len(), 1);
        assert!(history[0].label.contains("Chapter 3"));
    }
}
