//! One-hop regeneration of chapters affected by a change.
//!
//! For each dependency edge discovered for a single change event, the
//! coordinator requests new plot content and then new dialogue for the
//! target chapter, marks it updated, and appends a propagation record.
//!
//! Propagation is single-hop by construction: the coordinator never
//! re-scans the chapters it just regenerated. A second hop requires the
//! caller to emit a new change event. This bounds fan-out and makes
//! propagation cycles structurally impossible.

use crate::audit::AuditEvent;
use crate::context::RunContext;
use crate::dependency::DependencyEdge;
use crate::judge::{ChapterSpec, ContentService, RewriteScope};
use crate::story::{ChangeEvent, ChapterId, Story};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// What happened to one downstream chapter during propagation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationRecord {
    pub chapter_id: ChapterId,
    pub title: String,
    /// The original cause carried over from the change event.
    pub cause: String,
    pub plot_updated: bool,
    pub dialogue_updated: bool,
}

/// Drives one-hop regeneration of affected chapters.
pub struct PropagationCoordinator {
    content: Arc<dyn ContentService>,
}

impl PropagationCoordinator {
    pub fn new(content: Arc<dyn ContentService>) -> Self {
        Self { content }
    }

    /// Regenerate every edge target from one change event, in edge order.
    ///
    /// Chapters in BLOCKED state are skipped (no rewrite is built on
    /// halted content) and the skip is recorded in the audit log.
    pub async fn propagate(
        &self,
        ctx: &RunContext,
        story: &mut Story,
        event: &ChangeEvent,
        edges: &BTreeSet<DependencyEdge>,
    ) -> Vec<PropagationRecord> {
        let mut records = Vec::new();

        for edge in edges {
            if ctx.is_blocked(&edge.to_chapter) {
                tracing::info!(
                    chapter = %edge.to_chapter,
                    "skipping propagation into blocked chapter"
                );
                ctx.audit.append(AuditEvent::FailSafe {
                    call_site: "propagation".to_string(),
                    condition: format!(
                        "target {} is blocked; regeneration skipped",
                        edge.to_chapter
                    ),
                });
                continue;
            }

            let Some(target) = story.get(&edge.to_chapter) else {
                continue;
            };

            let spec = ChapterSpec::new(target.id.as_str(), target.title.clone())
                .with_roster(target.entities.clone())
                .with_instruction(format!(
                    "Upstream change in {}: {}. {}. Regenerate this chapter's \
                     content so it stays consistent with the change.",
                    event.chapter_id, event.cause, edge.reason
                ))
                .with_scope(RewriteScope::Chapter);

            let plot_updated = match self.content.generate_prose(&spec).await {
                Ok(prose) => {
                    if let Some(target) = story.get_mut(&edge.to_chapter) {
                        target.content = prose;
                    }
                    true
                }
                Err(err) => {
                    tracing::warn!(
                        chapter = %edge.to_chapter,
                        error = %err,
                        "plot regeneration failed, keeping existing content"
                    );
                    ctx.audit.append(AuditEvent::FailSafe {
                        call_site: "propagation.plot".to_string(),
                        condition: err.to_string(),
                    });
                    false
                }
            };

            let dialogue_updated = match self.content.generate_dialogue(&spec).await {
                Ok(lines) => {
                    if let Some(target) = story.get_mut(&edge.to_chapter) {
                        target.dialogue = lines;
                    }
                    true
                }
                Err(err) => {
                    tracing::warn!(
                        chapter = %edge.to_chapter,
                        error = %err,
                        "dialogue regeneration failed, keeping existing dialogue"
                    );
                    ctx.audit.append(AuditEvent::FailSafe {
                        call_site: "propagation.dialogue".to_string(),
                        condition: err.to_string(),
                    });
                    false
                }
            };

            let record = PropagationRecord {
                chapter_id: edge.to_chapter.clone(),
                title: story
                    .get(&edge.to_chapter)
                    .map(|c| c.title.clone())
                    .unwrap_or_default(),
                cause: event.cause.clone(),
                plot_updated,
                dialogue_updated,
            };
            ctx.audit.append(AuditEvent::Propagation {
                record: record.clone(),
            });
            records.push(record);
        }

        records
    }
}
