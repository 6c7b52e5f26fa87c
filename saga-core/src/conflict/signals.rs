//! Rule-based conflict signal detection for chapter edits.
//!
//! The detector sees only what the caller supplies: the change event and
//! the [`SceneContext`] visibility set. It never fetches facts on its own.
//! All signals default to false. An empty signal set is the normal
//! "no conflict" outcome, not an error.

use crate::judge::JudgmentService;
use crate::story::{contains_phrase, contains_word, ChangeEvent, SceneContext, Story};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

lazy_static::lazy_static! {
    /// Words ignored by the structural heuristics.
    static ref STOPWORDS: BTreeSet<&'static str> = [
        "the", "and", "but", "for", "nor", "with", "from", "into", "onto",
        "over", "under", "that", "this", "these", "those", "was", "were",
        "been", "being", "had", "has", "have", "did", "does", "will",
        "would", "could", "should", "she", "her", "hers", "him", "his",
        "they", "them", "their", "its", "are", "not", "then", "than",
        "when", "while", "where", "what", "who", "whom", "very", "just",
        "there", "here", "out", "about", "upon", "toward", "towards",
    ]
    .into_iter()
    .collect();
}

/// Connectives that excuse a topic jump between consecutive sentences.
const CONNECTIVES: &[&str] = &[
    "but", "then", "so", "meanwhile", "however", "later", "still", "yet",
    "and", "when", "after", "before", "elsewhere",
];

/// Minimum content words for a sentence to participate in the
/// near-duplicate check.
const REDUNDANCY_MIN_WORDS: usize = 4;

/// Jaccard similarity at or above which two sentences count as
/// near-duplicates.
const REDUNDANCY_THRESHOLD: f32 = 0.8;

/// Minimum content words for a sentence to participate in the
/// non-sequitur check.
const COHERENCE_MIN_WORDS: usize = 6;

/// The fixed boolean signal set produced for one chapter edit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictSignals {
    /// Established causal order is violated.
    pub temporal_violation: bool,
    /// Restricted future information surfaces early.
    pub spoiler_leak: bool,
    /// A character displays knowledge they should not have.
    pub memory_inconsistency: bool,
    /// New content negates an established fact.
    pub world_fact_contradiction: bool,
    /// Abrupt non-sequitur within the edited content.
    pub local_coherence_issue: bool,
    /// Near-duplicate phrasing within the edited content.
    pub redundancy_minor: bool,
    /// Whether a local rewrite could repair the conflict.
    pub fixable_by_rewrite: bool,
    /// The violated knowledge also appears in a later chapter.
    pub scope_cross_chapter: bool,
    /// Signal name → supporting evidence text.
    pub evidence: BTreeMap<String, String>,
}

impl ConflictSignals {
    /// The no-conflict signal set.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether any conflict signal is raised.
    pub fn any(&self) -> bool {
        self.temporal_violation
            || self.spoiler_leak
            || self.memory_inconsistency
            || self.world_fact_contradiction
            || self.local_coherence_issue
            || self.redundancy_minor
    }

    fn record(&mut self, signal: &str, evidence: String) {
        self.evidence.entry(signal.to_string()).or_insert(evidence);
    }
}

/// Turns a chapter edit plus scene-visible facts into conflict signals.
#[derive(Debug, Clone, Default)]
pub struct ConflictSignalDetector;

impl ConflictSignalDetector {
    pub fn new() -> Self {
        Self
    }

    /// Pure rule pass over the edit. Deterministic for identical inputs.
    pub fn detect(
        &self,
        event: &ChangeEvent,
        scene: &SceneContext,
        story: &Story,
    ) -> ConflictSignals {
        let mut signals = ConflictSignals::none();
        let content = &event.new_content;

        self.check_spoilers(content, scene, &mut signals);
        self.check_established_facts(content, scene, &mut signals);
        self.check_knowledge_restrictions(event, content, scene, story, &mut signals);
        self.check_structure(event.diff_region(), content, &mut signals);

        signals
    }

    /// Rule pass plus a best-effort judgment call on local coherence.
    ///
    /// The service assist only ever adds the soft `local_coherence_issue`
    /// signal; its failure leaves the rule-based result untouched.
    pub async fn detect_with_judge(
        &self,
        event: &ChangeEvent,
        scene: &SceneContext,
        story: &Story,
        judge: &dyn JudgmentService,
    ) -> ConflictSignals {
        let mut signals = self.detect(event, scene, story);
        if signals.local_coherence_issue {
            return signals;
        }

        let question = "Does the edited passage read as an abrupt non-sequitur \
                        against the rest of its chapter? Answer YES or NO.";
        let context = format!(
            "## Edited passage\n{}\n\n## Full chapter\n{}",
            event.diff_region(),
            event.new_content
        );
        match judge.ask_binary(question, &context).await {
            Ok(true) => {
                signals.local_coherence_issue = true;
                signals.record(
                    "local_coherence_issue",
                    "judgment service flagged the edited passage as a non-sequitur".to_string(),
                );
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(
                    chapter = %event.chapter_id,
                    error = %err,
                    "coherence judgment unavailable, keeping rule-based signals"
                );
            }
        }
        signals
    }

    fn check_spoilers(&self, content: &str, scene: &SceneContext, signals: &mut ConflictSignals) {
        for fact in &scene.future_facts {
            if scene.allowed_disclosures.contains(&fact.key) {
                continue;
            }
            if contains_phrase(content, &fact.text) {
                signals.spoiler_leak = true;
                signals.temporal_violation = true;
                signals.fixable_by_rewrite = false;
                signals.record(
                    "spoiler_leak",
                    format!(
                        "restricted future fact '{}' surfaces without disclosure clearance",
                        fact.key
                    ),
                );
            }
        }
    }

    fn check_established_facts(
        &self,
        content: &str,
        scene: &SceneContext,
        signals: &mut ConflictSignals,
    ) {
        for fact in &scene.established_facts {
            for negation in &fact.negations {
                if contains_phrase(content, negation) {
                    signals.world_fact_contradiction = true;
                    signals.record(
                        "world_fact_contradiction",
                        format!(
                            "established fact '{}' negated by phrasing '{}'",
                            fact.statement, negation
                        ),
                    );
                }
            }
        }
    }

    fn check_knowledge_restrictions(
        &self,
        event: &ChangeEvent,
        content: &str,
        scene: &SceneContext,
        story: &Story,
        signals: &mut ConflictSignals,
    ) {
        let changed_index = story.get(&event.chapter_id).map(|c| c.index);

        for restriction in &scene.knowledge_restrictions {
            if !contains_word(content, &restriction.character) {
                continue;
            }
            let leaked: Vec<&String> = restriction
                .telltale_phrases
                .iter()
                .filter(|phrase| contains_phrase(content, phrase))
                .collect();
            if leaked.is_empty() {
                continue;
            }

            signals.memory_inconsistency = true;
            signals.record(
                "memory_inconsistency",
                format!(
                    "'{}' displays restricted knowledge of '{}'",
                    restriction.character, restriction.topic
                ),
            );

            // Cross-chapter scope: the same violated knowledge already
            // exists in a later generated chapter.
            if let Some(index) = changed_index {
                for later in story.after(index) {
                    if leaked
                        .iter()
                        .any(|phrase| contains_phrase(&later.content, phrase))
                        || later
                            .dialogue
                            .iter()
                            .any(|l| leaked.iter().any(|p| contains_phrase(&l.line, p)))
                    {
                        signals.scope_cross_chapter = true;
                        signals.record(
                            "scope_cross_chapter",
                            format!(
                                "restricted knowledge of '{}' also appears in {}",
                                restriction.topic, later.id
                            ),
                        );
                        break;
                    }
                }
            }
        }
    }

    /// Best-effort structural heuristics over the edited region. These are
    /// extensible and deliberately conservative; they are not load-bearing
    /// for correctness.
    fn check_structure(&self, region: &str, content: &str, signals: &mut ConflictSignals) {
        let scope = if region.trim().is_empty() { content } else { region };
        let sentences = split_sentences(scope);
        let word_sets: Vec<BTreeSet<String>> =
            sentences.iter().map(|s| content_words(s)).collect();

        // Near-duplicate phrasing.
        'outer: for i in 0..word_sets.len() {
            if word_sets[i].len() < REDUNDANCY_MIN_WORDS {
                continue;
            }
            for j in (i + 1)..word_sets.len() {
                if word_sets[j].len() < REDUNDANCY_MIN_WORDS {
                    continue;
                }
                if jaccard(&word_sets[i], &word_sets[j]) >= REDUNDANCY_THRESHOLD {
                    signals.redundancy_minor = true;
                    signals.record(
                        "redundancy_minor",
                        format!(
                            "near-duplicate phrasing: '{}' / '{}'",
                            sentences[i].trim(),
                            sentences[j].trim()
                        ),
                    );
                    break 'outer;
                }
            }
        }

        // Abrupt non-sequitur between consecutive substantial sentences.
        for i in 1..word_sets.len() {
            if word_sets[i - 1].len() < COHERENCE_MIN_WORDS
                || word_sets[i].len() < COHERENCE_MIN_WORDS
            {
                continue;
            }
            let opener = sentences[i]
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_lowercase();
            if CONNECTIVES.contains(&opener.as_str()) {
                continue;
            }
            if jaccard(&word_sets[i - 1], &word_sets[i]) == 0.0 {
                signals.local_coherence_issue = true;
                signals.record(
                    "local_coherence_issue",
                    format!("abrupt topic change at '{}'", sentences[i].trim()),
                );
                break;
            }
        }
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    text.split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn content_words(sentence: &str) -> BTreeSet<String> {
    sentence
        .split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() >= 3 && !STOPWORDS.contains(w.as_str()))
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::{Chapter, EstablishedFact, FutureFact, KnowledgeRestriction};
    use crate::testing::MockJudge;

    fn story() -> Story {
        Story::new()
            .with_chapter(
                Chapter::new("Chapter 3", 2, "The Ford").with_content("Mira kept her own counsel."),
            )
            .with_chapter(Chapter::new("Chapter 4", 3, "The Road").with_content("Rain fell."))
            .with_chapter(
                Chapter::new("Chapter 5", 4, "The Reckoning")
                    .with_content("Mira spoke of the betrayal at the ford as if she had seen it."),
            )
    }

    fn event(new_content: &str) -> ChangeEvent {
        ChangeEvent::new("Chapter 3", "Mira kept her own counsel.", new_content, "edit")
    }

    #[test]
    fn test_no_conflict_is_all_false() {
        let detector = ConflictSignalDetector::new();
        let signals = detector.detect(
            &event("Mira kept her own counsel, watching the rain."),
            &SceneContext::new(),
            &story(),
        );

        assert!(!signals.any());
        assert_eq!(signals, ConflictSignals::none());
    }

    #[test]
    fn test_spoiler_leak_sets_temporal_and_unfixable() {
        let scene = SceneContext::new().with_future_fact(FutureFact::new(
            "duke-death",
            "the duke dies at the masquerade",
        ));
        let detector = ConflictSignalDetector::new();
        let signals = detector.detect(
            &event("She whispered that the duke dies at the masquerade."),
            &scene,
            &story(),
        );

        assert!(signals.spoiler_leak);
        assert!(signals.temporal_violation);
        assert!(!signals.fixable_by_rewrite);
        assert!(signals.evidence.contains_key("spoiler_leak"));
    }

    #[test]
    fn test_allowed_disclosure_is_not_a_spoiler() {
        let scene = SceneContext::new()
            .with_future_fact(FutureFact::new(
                "duke-death",
                "the duke dies at the masquerade",
            ))
            .with_allowed_disclosure("duke-death");
        let detector = ConflictSignalDetector::new();
        let signals = detector.detect(
            &event("She whispered that the duke dies at the masquerade."),
            &scene,
            &story(),
        );

        assert!(!signals.spoiler_leak);
        assert!(!signals.temporal_violation);
    }

    #[test]
    fn test_world_fact_contradiction() {
        let scene = SceneContext::new().with_established_fact(
            EstablishedFact::new("The city gates were sealed after dusk")
                .with_negation("the gates stood open all night"),
        );
        let detector = ConflictSignalDetector::new();
        let signals = detector.detect(
            &event("To her surprise the gates stood open all night."),
            &scene,
            &story(),
        );

        assert!(signals.world_fact_contradiction);
    }

    #[test]
    fn test_memory_inconsistency_cross_chapter() {
        let scene = SceneContext::new().with_restriction(
            KnowledgeRestriction::new("Mira", "the betrayal")
                .with_phrase("the betrayal at the ford"),
        );
        let detector = ConflictSignalDetector::new();
        let signals = detector.detect(
            &event("Mira spoke bitterly of the betrayal at the ford."),
            &scene,
            &story(),
        );

        assert!(signals.memory_inconsistency);
        assert!(signals.scope_cross_chapter);
        assert!(signals.evidence.contains_key("scope_cross_chapter"));
    }

    #[test]
    fn test_memory_inconsistency_local_only() {
        let scene = SceneContext::new().with_restriction(
            KnowledgeRestriction::new("Mira", "the poisoned well")
                .with_phrase("the well was poisoned"),
        );
        let detector = ConflictSignalDetector::new();
        let signals = detector.detect(
            &event("Mira muttered that the well was poisoned."),
            &scene,
            &story(),
        );

        assert!(signals.memory_inconsistency);
        assert!(!signals.scope_cross_chapter);
    }

    #[test]
    fn test_redundancy_detection() {
        let detector = ConflictSignalDetector::new();
        let signals = detector.detect(
            &event(
                "The ancient tower loomed dark against the evening sky. \
                 The ancient tower loomed dark against the evening sky.",
            ),
            &SceneContext::new(),
            &story(),
        );

        assert!(signals.redundancy_minor);
    }

    #[tokio::test]
    async fn test_judge_assist_adds_coherence_flag() {
        let judge = MockJudge::new();
        judge.queue_binary(true);

        let detector = ConflictSignalDetector::new();
        let signals = detector
            .detect_with_judge(
                &event("Mira kept her own counsel under the eaves."),
                &SceneContext::new(),
                &story(),
                &judge,
            )
            .await;

        assert!(signals.local_coherence_issue);
    }

    #[tokio::test]
    async fn test_judge_assist_failure_is_best_effort() {
        let judge = MockJudge::unavailable();

        let detector = ConflictSignalDetector::new();
        let signals = detector
            .detect_with_judge(
                &event("Mira kept her own counsel under the eaves."),
                &SceneContext::new(),
                &story(),
                &judge,
            )
            .await;

        assert!(!signals.local_coherence_issue);
    }

    #[test]
    fn test_determinism() {
        let scene = SceneContext::new().with_restriction(
            KnowledgeRestriction::new("Mira", "the betrayal")
                .with_phrase("the betrayal at the ford"),
        );
        let detector = ConflictSignalDetector::new();
        let event = event("Mira spoke bitterly of the betrayal at the ford.");

        let first = detector.detect(&event, &scene, &story());
        let second = detector.detect(&event, &scene, &story());
        assert_eq!(first, second);
    }
}
