//! Per-run state owned by the orchestrator.
//!
//! There is no global mutable state anywhere in the engine: cooldown
//! flags, chapter resolution states, per-chapter locks, the audit log, and
//! the hook installation all live here, created once per story-generation
//! run. Two concurrent runs never share a context.

use crate::audit::AuditLog;
use crate::hooks::{PipelineHooks, Stage};
use crate::resolution::ChapterState;
use crate::story::ChapterId;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

/// Unique identifier for one story-generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The per-run context.
///
/// Interior mutability is per concern, so independent chapters can proceed
/// concurrently: cooldowns and states sit behind their own locks, and each
/// chapter gets an async mutex held for the duration of its ASSESSING span
/// so overlapping change events serialize.
pub struct RunContext {
    pub run_id: RunId,
    cooldowns: Mutex<HashMap<ChapterId, bool>>,
    states: RwLock<HashMap<ChapterId, ChapterState>>,
    locks: Mutex<HashMap<ChapterId, Arc<tokio::sync::Mutex<()>>>>,
    pub audit: AuditLog,
    hooks: Option<Arc<dyn PipelineHooks>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: RunId::new(),
            cooldowns: Mutex::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            audit: AuditLog::new(),
            hooks: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn PipelineHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Reset per-chapter drafting state at a chapter boundary.
    pub fn begin_chapter(&self, chapter: &ChapterId) {
        self.cooldowns
            .lock()
            .expect("cooldown lock poisoned")
            .insert(chapter.clone(), false);
        self.states
            .write()
            .expect("state lock poisoned")
            .entry(chapter.clone())
            .or_insert(ChapterState::Clean);
    }

    /// The cooldown flag for a chapter (false if never set).
    pub fn last_inserted(&self, chapter: &ChapterId) -> bool {
        self.cooldowns
            .lock()
            .expect("cooldown lock poisoned")
            .get(chapter)
            .copied()
            .unwrap_or(false)
    }

    /// Commit the cooldown flag after a finalized decision. Callers update
    /// in point order only.
    pub fn set_last_inserted(&self, chapter: &ChapterId, inserted: bool) {
        self.cooldowns
            .lock()
            .expect("cooldown lock poisoned")
            .insert(chapter.clone(), inserted);
    }

    /// The chapter's resolution state (CLEAN if never assessed).
    pub fn state(&self, chapter: &ChapterId) -> ChapterState {
        self.states
            .read()
            .expect("state lock poisoned")
            .get(chapter)
            .copied()
            .unwrap_or(ChapterState::Clean)
    }

    pub fn set_state(&self, chapter: &ChapterId, state: ChapterState) {
        self.states
            .write()
            .expect("state lock poisoned")
            .insert(chapter.clone(), state);
    }

    /// Whether the chapter is blocked pending manual attention.
    pub fn is_blocked(&self, chapter: &ChapterId) -> bool {
        self.state(chapter) == ChapterState::Blocked
    }

    /// Manually clear a halt: the only path out of BLOCKED.
    pub fn clear_halt(&self, chapter: &ChapterId) -> bool {
        let mut states = self.states.write().expect("state lock poisoned");
        match states.get(chapter) {
            Some(ChapterState::Blocked) => {
                states.insert(chapter.clone(), ChapterState::Clean);
                true
            }
            _ => false,
        }
    }

    /// The chapter's assessment mutex, created on first use. Held for the
    /// chapter's ASSESSING span so overlapping change events serialize.
    pub fn chapter_lock(&self, chapter: &ChapterId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .expect("chapter-lock table poisoned")
            .entry(chapter.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Notify hooks of a stage start. Best-effort: failures are logged and
    /// swallowed.
    pub fn stage_start(&self, stage: Stage, meta: &Value) {
        if let Some(hooks) = &self.hooks {
            if let Err(err) = hooks.on_stage_start(stage, meta) {
                tracing::warn!(stage = stage.name(), %err, "stage-start hook failed");
            }
        }
    }

    /// Notify hooks of a stage end. Best-effort.
    pub fn stage_end(&self, stage: Stage, meta: &Value) {
        if let Some(hooks) = &self.hooks {
            if let Err(err) = hooks.on_stage_end(stage, meta) {
                tracing::warn!(stage = stage.name(), %err, "stage-end hook failed");
            }
        }
    }

    /// Notify hooks of an error condition. Best-effort.
    pub fn stage_error(&self, stage: Stage, meta: &Value) {
        if let Some(hooks) = &self.hooks {
            if let Err(err) = hooks.on_error(stage, meta) {
                tracing::warn!(stage = stage.name(), %err, "error hook failed");
            }
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cooldown_lifecycle() {
        let ctx = RunContext::new();
        let chapter = ChapterId::new("Chapter 1");

        assert!(!ctx.last_inserted(&chapter));
        ctx.set_last_inserted(&chapter, true);
        assert!(ctx.last_inserted(&chapter));

        // Chapter boundary resets the flag.
        ctx.begin_chapter(&chapter);
        assert!(!ctx.last_inserted(&chapter));
    }

    #[test]
    fn test_cooldowns_are_per_chapter() {
        let ctx = RunContext::new();
        let one = ChapterId::new("Chapter 1");
        let two = ChapterId::new("Chapter 2");

        ctx.set_last_inserted(&one, true);
        assert!(ctx.last_inserted(&one));
        assert!(!ctx.last_inserted(&two));
    }

    #[test]
    fn test_state_machine_default_clean() {
        let ctx = RunContext::new();
        let chapter = ChapterId::new("Chapter 4");

        assert_eq!(ctx.state(&chapter), ChapterState::Clean);
        ctx.set_state(&chapter, ChapterState::Assessing);
        assert_eq!(ctx.state(&chapter), ChapterState::Assessing);
    }

    #[test]
    fn test_clear_halt_only_from_blocked() {
        let ctx = RunContext::new();
        let chapter = ChapterId::new("Chapter 4");

        assert!(!ctx.clear_halt(&chapter));

        ctx.set_state(&chapter, ChapterState::Blocked);
        assert!(ctx.is_blocked(&chapter));
        assert!(ctx.clear_halt(&chapter));
        assert_eq!(ctx.state(&chapter), ChapterState::Clean);
    }

    #[test]
    fn test_chapter_lock_is_stable() {
        let ctx = RunContext::new();
        let chapter = ChapterId::new("Chapter 1");

        let first = ctx.chapter_lock(&chapter);
        let second = ctx.chapter_lock(&chapter);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_chapter_lock_serializes() {
        let ctx = RunContext::new();
        let chapter = ChapterId::new("Chapter 1");

        let lock = ctx.chapter_lock(&chapter);
        let guard = lock.lock().await;
        assert!(ctx.chapter_lock(&chapter).try_lock().is_err());
        drop(guard);
        assert!(ctx.chapter_lock(&chapter).try_lock().is_ok());
    }

    #[test]
    fn test_two_runs_share_nothing() {
        let a = RunContext::new();
        let b = RunContext::new();
        let chapter = ChapterId::new("Chapter 1");

        a.set_last_inserted(&chapter, true);
        assert!(!b.last_inserted(&chapter));
        assert_ne!(a.run_id, b.run_id);
    }

    #[test]
    fn test_hooks_failures_swallowed() {
        struct Failing;
        impl PipelineHooks for Failing {
            fn on_stage_start(&self, _: Stage, _: &Value) -> Result<(), String> {
                Err("broken".to_string())
            }
        }

        let ctx = RunContext::new().with_hooks(Arc::new(Failing));
        // Must not panic or propagate.
        ctx.stage_start(Stage::Resolution, &json!({}));
        ctx.stage_end(Stage::Resolution, &json!({}));
        ctx.stage_error(Stage::Resolution, &json!({}));
    }
}
