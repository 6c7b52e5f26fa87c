//! Downstream dependency discovery for chapter edits.
//!
//! A pure, deterministic scan: no service calls, no randomness, no
//! ordering sensitivity. Identical inputs always produce the identical
//! edge set. Only chapters after the changed one are examined; the
//! pipeline treats chapter order as causal order, so earlier chapters
//! cannot depend on a later edit.

use crate::story::{contains_word, ChangeEvent, ChapterId, Story};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A discovered dependency: the target chapter shares entities with the
/// changed region of the source chapter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from_chapter: ChapterId,
    pub to_chapter: ChapterId,
    /// Entities appearing in both the changed region and the target.
    pub shared_entities: BTreeSet<String>,
    /// Human-readable justification for the edge.
    pub reason: String,
}

/// Finds downstream chapters affected by a change.
#[derive(Debug, Clone, Default)]
pub struct DependencyTracker;

impl DependencyTracker {
    pub fn new() -> Self {
        Self
    }

    /// Scan every chapter after the changed one for entities that occur in
    /// the changed region of the new content.
    ///
    /// Returns the edges as a set: callers must not depend on discovery
    /// order beyond the set's own deterministic ordering.
    pub fn scan(&self, story: &Story, event: &ChangeEvent) -> BTreeSet<DependencyEdge> {
        let mut edges = BTreeSet::new();

        let Some(changed) = story.get(&event.chapter_id) else {
            return edges;
        };

        let region = {
            let diff = event.diff_region();
            if diff.trim().is_empty() {
                // Degenerate diff (identical or fully swapped content):
                // fall back to the whole new content so no mention is
                // missed.
                &event.new_content
            } else {
                diff
            }
        };

        // Entity vocabulary: every roster entry in the story. BTreeSet
        // gives case-stable, deterministic iteration.
        let vocabulary: BTreeSet<&str> = story
            .chapters()
            .iter()
            .flat_map(|c| c.entities.iter().map(String::as_str))
            .collect();

        let changed_entities: BTreeSet<&str> = vocabulary
            .iter()
            .copied()
            .filter(|name| contains_word(region, name))
            .collect();
        if changed_entities.is_empty() {
            return edges;
        }

        for downstream in story.after(changed.index) {
            let shared: BTreeSet<String> = changed_entities
                .iter()
                .filter(|name| {
                    downstream.entities.iter().any(|e| e.eq_ignore_ascii_case(name))
                        || downstream.mentions(name)
                })
                .map(|name| name.to_string())
                .collect();

            if shared.is_empty() {
                continue;
            }

            let names: Vec<&str> = shared.iter().map(String::as_str).collect();
            let reason = format!(
                "entity {} changed in {} and reappears in {}",
                names.join(", "),
                changed.id,
                downstream.id
            );
            edges.insert(DependencyEdge {
                from_chapter: changed.id.clone(),
                to_chapter: downstream.id.clone(),
                shared_entities: shared,
                reason,
            });
        }

        edges
    }
}
