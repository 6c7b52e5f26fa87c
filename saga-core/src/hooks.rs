//! Best-effort orchestrator hooks.
//!
//! The orchestrator can observe stage transitions without being able to
//! break them: a failing hook is logged and swallowed, never propagated.

use serde_json::Value;

/// Pipeline stages visible to hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Affordance,
    InsertionDecision,
    ConflictDetection,
    SeverityClassification,
    Consensus,
    Resolution,
    Propagation,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Affordance => "affordance",
            Stage::InsertionDecision => "insertion-decision",
            Stage::ConflictDetection => "conflict-detection",
            Stage::SeverityClassification => "severity-classification",
            Stage::Consensus => "consensus",
            Stage::Resolution => "resolution",
            Stage::Propagation => "propagation",
        }
    }
}

/// Observer callbacks around pipeline stages. All default to no-ops.
pub trait PipelineHooks: Send + Sync {
    fn on_stage_start(&self, _stage: Stage, _meta: &Value) -> Result<(), String> {
        Ok(())
    }

    fn on_stage_end(&self, _stage: Stage, _meta: &Value) -> Result<(), String> {
        Ok(())
    }

    fn on_error(&self, _stage: Stage, _meta: &Value) -> Result<(), String> {
        Ok(())
    }
}

/// The default observer: sees nothing, changes nothing.
pub struct NoopHooks;

impl PipelineHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recording {
        events: Mutex<Vec<String>>,
        fail: bool,
    }

    impl PipelineHooks for Recording {
        fn on_stage_start(&self, stage: Stage, _meta: &Value) -> Result<(), String> {
            self.events
                .lock()
                .unwrap()
                .push(format!("start:{}", stage.name()));
            if self.fail {
                Err("hook exploded".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Resolution.name(), "resolution");
        assert_eq!(Stage::ConflictDetection.name(), "conflict-detection");
    }

    #[test]
    fn test_default_hooks_are_noops() {
        let hooks = NoopHooks;
        assert!(hooks.on_stage_start(Stage::Consensus, &json!({})).is_ok());
        assert!(hooks.on_stage_end(Stage::Consensus, &json!({})).is_ok());
        assert!(hooks.on_error(Stage::Consensus, &json!({})).is_ok());
    }

    #[test]
    fn test_recording_hooks_observe() {
        let hooks = Recording {
            events: Mutex::new(Vec::new()),
            fail: true,
        };

        // A hook may fail; the caller is responsible for swallowing it.
        assert!(hooks.on_stage_start(Stage::Propagation, &json!({})).is_err());
        assert_eq!(hooks.events.lock().unwrap().len(), 1);
    }
}
