//! Narrative consistency and conflict-resolution engine for staged story
//! generation.
//!
//! This crate provides:
//! - Dialogue-affordance classification and a symbolic insertion decider
//!   with per-chapter cooldown
//! - Conflict signal detection for chapter edits (spoilers, contradicted
//!   facts, character-knowledge violations) and an ordinal severity ladder
//! - Consensus over independent judgments (binary and ordinal)
//! - Deterministic downstream dependency discovery and one-hop propagation
//! - A total severity → action resolution table with rollback and halt
//!
//! External text generation and judgment stay behind service traits; every
//! service failure degrades to a documented fail-safe and every decision
//! carries a reconstructable reason trace in the per-run audit log.
//!
//! # Quick Start
//!
//! ```ignore
//! use saga_core::{ConsistencyEngine, RunContext};
//! use saga_core::judge::{OracleContent, OracleJudge};
//! use saga_core::store::MemoryStore;
//! use saga_core::story::{ChangeEvent, SceneContext, Story};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = ConsistencyEngine::new(
//!         Arc::new(OracleJudge::from_env()?),
//!         Arc::new(OracleContent::from_env()?),
//!         Arc::new(MemoryStore::new()),
//!     );
//!
//!     let ctx = RunContext::new();
//!     let mut story = Story::new();
//!     // ... add chapters, then assess an edit:
//!     let event = ChangeEvent::new("Chapter 3", "before", "after", "operator edit");
//!     let outcome = engine
//!         .assess_change(&ctx, &mut story, event, &SceneContext::new())
//!         .await?;
//!     println!("{:?}", outcome.action);
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod conflict;
pub mod consensus;
pub mod context;
pub mod dependency;
pub mod dialogue;
pub mod engine;
pub mod hooks;
pub mod judge;
pub mod labels;
pub mod propagation;
pub mod resolution;
pub mod store;
pub mod story;
pub mod testing;

// Primary public API
pub use conflict::{ConflictSignalDetector, ConflictSignals, SeverityClassifier, SeverityLevel};
pub use consensus::{BinaryVote, ConsensusEngine, ConsensusResult, SeverityVote, Vote};
pub use context::{RunContext, RunId};
pub use dependency::{DependencyEdge, DependencyTracker};
pub use dialogue::{AffordanceClassifier, DialogueInsertionDecider, InsertionDecision};
pub use engine::{ChangeOutcome, ConsistencyEngine, EngineConfig, EngineError};
pub use labels::{AffordanceLabels, InfoValue, Intensity, Pacing, Presence};
pub use propagation::{PropagationCoordinator, PropagationRecord};
pub use resolution::{ChapterState, ResolutionAction, ResolutionStrategy};
pub use story::{ChangeEvent, Chapter, ChapterId, NarrativePoint, SceneContext, Story};
pub use testing::{MockContent, MockJudge, StoryHarness};
