//! Resolution: mapping severity to action and carrying the action out.
//!
//! The severity → action table is static and total: every rung of the
//! ladder maps to exactly one action. ACCEPT is a no-op; the rewrite
//! actions delegate to the content service at sentence or scene scope;
//! ROLLBACK restores the snapshot taken before the offending change and
//! flags the chapter for regeneration; HALT blocks the chapter until a
//! human clears it and is never auto-retried.

use crate::audit::AuditEvent;
use crate::conflict::{SeverityDecision, SeverityLevel};
use crate::context::RunContext;
use crate::hooks::Stage;
use crate::judge::{ChapterSpec, ContentService, RewriteScope};
use crate::store::{SnapshotId, StateStore};
use crate::story::{ChangeEvent, ChapterId, Story};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What the engine does about a classified conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionAction {
    Accept,
    RewriteLocal,
    RewriteScene,
    Rollback,
    Halt,
}

impl ResolutionAction {
    pub fn name(&self) -> &'static str {
        match self {
            ResolutionAction::Accept => "ACCEPT",
            ResolutionAction::RewriteLocal => "REWRITE_LOCAL",
            ResolutionAction::RewriteScene => "REWRITE_SCENE",
            ResolutionAction::Rollback => "ROLLBACK",
            ResolutionAction::Halt => "HALT",
        }
    }
}

/// Per-chapter resolution state.
///
/// CLEAN → ASSESSING → {CLEAN, BLOCKED}; BLOCKED is terminal until
/// [`RunContext::clear_halt`] is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChapterState {
    Clean,
    Assessing,
    Blocked,
}

impl ChapterState {
    pub fn name(&self) -> &'static str {
        match self {
            ChapterState::Clean => "CLEAN",
            ChapterState::Assessing => "ASSESSING",
            ChapterState::Blocked => "BLOCKED",
        }
    }
}

/// The result of executing a resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub action: ResolutionAction,
    /// Ordered execution notes (what was done, what failed).
    pub notes: Vec<String>,
    /// True only for HALT.
    pub halted: bool,
    /// A chapter flagged for regeneration after a rollback.
    pub regenerate: Option<ChapterId>,
}

/// Executes the severity → action table.
pub struct ResolutionStrategy {
    content: Arc<dyn ContentService>,
    store: Arc<dyn StateStore>,
}

impl ResolutionStrategy {
    pub fn new(content: Arc<dyn ContentService>, store: Arc<dyn StateStore>) -> Self {
        Self { content, store }
    }

    /// The static, total severity → action table.
    pub fn action_for(level: SeverityLevel) -> ResolutionAction {
        match level {
            SeverityLevel::None => ResolutionAction::Accept,
            SeverityLevel::Low => ResolutionAction::RewriteLocal,
            SeverityLevel::Medium => ResolutionAction::RewriteScene,
            SeverityLevel::High => ResolutionAction::Rollback,
            SeverityLevel::Critical => ResolutionAction::Halt,
        }
    }

    /// Carry out the action for a classified change.
    ///
    /// `snapshot` is the handle captured before the change was applied;
    /// ROLLBACK restores it.
    pub async fn execute(
        &self,
        ctx: &RunContext,
        story: &mut Story,
        event: &ChangeEvent,
        decision: &SeverityDecision,
        snapshot: Option<SnapshotId>,
    ) -> ResolutionOutcome {
        let action = Self::action_for(decision.level);
        let mut outcome = ResolutionOutcome {
            action,
            notes: Vec::new(),
            halted: false,
            regenerate: None,
        };

        match action {
            ResolutionAction::Accept => {
                outcome.notes.push("ACCEPT: change kept as-is".to_string());
            }
            ResolutionAction::RewriteLocal => {
                self.rewrite(story, event, decision, RewriteScope::Sentence, ctx, &mut outcome)
                    .await;
            }
            ResolutionAction::RewriteScene => {
                self.rewrite(story, event, decision, RewriteScope::Scene, ctx, &mut outcome)
                    .await;
            }
            ResolutionAction::Rollback => {
                self.rollback(ctx, story, event, snapshot, &mut outcome).await;
            }
            ResolutionAction::Halt => {
                ctx.set_state(&event.chapter_id, ChapterState::Blocked);
                let reason = decision
                    .reasons
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "critical conflict".to_string());
                ctx.audit.append(AuditEvent::Halt {
                    chapter: event.chapter_id.clone(),
                    reason: reason.clone(),
                });
                ctx.stage_error(
                    Stage::Resolution,
                    &serde_json::json!({
                        "chapter": event.chapter_id.as_str(),
                        "reason": reason,
                    }),
                );
                outcome.halted = true;
                outcome
                    .notes
                    .push(format!("HALT: {} blocked for operator review", event.chapter_id));
            }
        }

        outcome
    }

    async fn rewrite(
        &self,
        story: &mut Story,
        event: &ChangeEvent,
        decision: &SeverityDecision,
        scope: RewriteScope,
        ctx: &RunContext,
        outcome: &mut ResolutionOutcome,
    ) {
        let Some(chapter) = story.get(&event.chapter_id) else {
            outcome
                .notes
                .push(format!("rewrite skipped: unknown chapter {}", event.chapter_id));
            return;
        };

        let spec = ChapterSpec::new(chapter.id.as_str(), chapter.title.clone())
            .with_roster(chapter.entities.clone())
            .with_instruction(format!(
                "Rewrite to resolve a detected conflict. Cause of change: {}. \
                 Conflict reasons: {}. Preserve everything else.",
                event.cause,
                decision.reasons.join("; ")
            ))
            .with_scope(scope);

        match self.content.generate_prose(&spec).await {
            Ok(prose) => {
                if let Some(chapter) = story.get_mut(&event.chapter_id) {
                    chapter.content = prose;
                }
                outcome
                    .notes
                    .push(format!("{}: content rewritten", outcome.action.name()));
            }
            Err(err) => {
                tracing::warn!(
                    chapter = %event.chapter_id,
                    error = %err,
                    "rewrite failed, original content kept"
                );
                ctx.audit.append(AuditEvent::FailSafe {
                    call_site: "resolution.rewrite".to_string(),
                    condition: err.to_string(),
                });
                outcome.notes.push(format!(
                    "{}: rewrite unavailable ({err}), content kept",
                    outcome.action.name()
                ));
            }
        }
    }

    async fn rollback(
        &self,
        ctx: &RunContext,
        story: &mut Story,
        event: &ChangeEvent,
        snapshot: Option<SnapshotId>,
        outcome: &mut ResolutionOutcome,
    ) {
        let Some(snapshot) = snapshot else {
            outcome
                .notes
                .push("ROLLBACK: no snapshot preceding the change, content kept".to_string());
            ctx.audit.append(AuditEvent::FailSafe {
                call_site: "resolution.rollback".to_string(),
                condition: "no snapshot available".to_string(),
            });
            return;
        };

        match self.store.rollback(snapshot).await {
            Ok(()) => {
                // Restore the chapter text from the rolled-back store state.
                let key = chapter_key(&event.chapter_id);
                if let Ok(Some(value)) = self.store.get(&key).await {
                    if let (Some(content), Some(chapter)) =
                        (value.as_str(), story.get_mut(&event.chapter_id))
                    {
                        chapter.content = content.to_string();
                    }
                }
                outcome.regenerate = Some(event.chapter_id.clone());
                outcome.notes.push(format!(
                    "ROLLBACK: restored snapshot {snapshot}, chapter flagged for regeneration"
                ));
            }
            Err(err) => {
                tracing::warn!(
                    chapter = %event.chapter_id,
                    error = %err,
                    "rollback failed, content kept"
                );
                ctx.audit.append(AuditEvent::FailSafe {
                    call_site: "resolution.rollback".to_string(),
                    condition: err.to_string(),
                });
                outcome
                    .notes
                    .push(format!("ROLLBACK: store failure ({err}), content kept"));
            }
        }
    }
}

/// The store key holding a chapter's authoritative text.
pub(crate) fn chapter_key(id: &ChapterId) -> String {
    format!("chapter:{id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictSignals;
    use crate::store::MemoryStore;
    use crate::story::Chapter;
    use crate::testing::MockContent;
    use serde_json::json;

    fn decision(level: SeverityLevel) -> SeverityDecision {
        SeverityDecision {
            level,
            reasons: vec![format!("test decision at {}", level.label())],
            signals: ConflictSignals::none(),
        }
    }

    fn story() -> Story {
        Story::new().with_chapter(
            Chapter::new("Chapter 3", 2, "The Ford").with_content("Edited content."),
        )
    }

    fn event() -> ChangeEvent {
        ChangeEvent::new("Chapter 3", "Original content.", "Edited content.", "edit")
    }

    #[test]
    fn test_table_is_total() {
        let expected = [
            (SeverityLevel::None, ResolutionAction::Accept),
            (SeverityLevel::Low, ResolutionAction::RewriteLocal),
            (SeverityLevel::Medium, ResolutionAction::RewriteScene),
            (SeverityLevel::High, ResolutionAction::Rollback),
            (SeverityLevel::Critical, ResolutionAction::Halt),
        ];
        for (level, action) in expected {
            assert_eq!(ResolutionStrategy::action_for(level), action);
        }
    }

    #[tokio::test]
    async fn test_accept_is_noop() {
        let strategy =
            ResolutionStrategy::new(Arc::new(MockContent::new()), Arc::new(MemoryStore::new()));
        let ctx = RunContext::new();
        let mut story = story();

        let outcome = strategy
            .execute(&ctx, &mut story, &event(), &decision(SeverityLevel::None), None)
            .await;

        assert_eq!(outcome.action, ResolutionAction::Accept);
        assert!(!outcome.halted);
        assert_eq!(
            story.get(&ChapterId::new("Chapter 3")).unwrap().content,
            "Edited content."
        );
    }

    #[tokio::test]
    async fn test_rewrite_local_replaces_content() {
        let content = Arc::new(MockContent::new().with_prose("Smoothed content."));
        let strategy = ResolutionStrategy::new(content, Arc::new(MemoryStore::new()));
        let ctx = RunContext::new();
        let mut story = story();

        let outcome = strategy
            .execute(&ctx, &mut story, &event(), &decision(SeverityLevel::Low), None)
            .await;

        assert_eq!(outcome.action, ResolutionAction::RewriteLocal);
        assert_eq!(
            story.get(&ChapterId::new("Chapter 3")).unwrap().content,
            "Smoothed content."
        );
    }

    #[tokio::test]
    async fn test_rewrite_failure_keeps_content() {
        let strategy =
            ResolutionStrategy::new(Arc::new(MockContent::failing()), Arc::new(MemoryStore::new()));
        let ctx = RunContext::new();
        let mut story = story();

        let outcome = strategy
            .execute(&ctx, &mut story, &event(), &decision(SeverityLevel::Medium), None)
            .await;

        assert_eq!(outcome.action, ResolutionAction::RewriteScene);
        assert_eq!(
            story.get(&ChapterId::new("Chapter 3")).unwrap().content,
            "Edited content."
        );
        assert_eq!(ctx.audit.fail_safe_count(), 1);
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let key = chapter_key(&ChapterId::new("Chapter 3"));
        store.set(&key, json!("Original content."), None).await.unwrap();
        let snapshot = store.snapshot("pre-edit").await.unwrap();
        store.set(&key, json!("Edited content."), None).await.unwrap();

        let strategy = ResolutionStrategy::new(Arc::new(MockContent::new()), store);
        let ctx = RunContext::new();
        let mut story = story();

        let outcome = strategy
            .execute(
                &ctx,
                &mut story,
                &event(),
                &decision(SeverityLevel::High),
                Some(snapshot),
            )
            .await;

        assert_eq!(outcome.action, ResolutionAction::Rollback);
        assert_eq!(outcome.regenerate, Some(ChapterId::new("Chapter 3")));
        assert_eq!(
            story.get(&ChapterId::new("Chapter 3")).unwrap().content,
            "Original content."
        );
    }

    #[tokio::test]
    async fn test_halt_blocks_chapter() {
        let strategy =
            ResolutionStrategy::new(Arc::new(MockContent::new()), Arc::new(MemoryStore::new()));
        let ctx = RunContext::new();
        let mut story = story();

        let outcome = strategy
            .execute(
                &ctx,
                &mut story,
                &event(),
                &decision(SeverityLevel::Critical),
                None,
            )
            .await;

        assert!(outcome.halted);
        assert_eq!(outcome.action, ResolutionAction::Halt);
        assert!(ctx.is_blocked(&ChapterId::new("Chapter 3")));
        assert_eq!(ctx.audit.halts(), vec![ChapterId::new("Chapter 3")]);
    }
}
