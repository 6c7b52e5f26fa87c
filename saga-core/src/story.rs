//! Story data model: chapters, narrative points, and scene visibility.
//!
//! Chapters are indexed by causal order: the pipeline treats chapter order
//! as the order in which events become established. Everything the conflict
//! detector is allowed to see about a scene arrives through [`SceneContext`],
//! supplied by the caller; the engine never fetches facts on its own.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Display-oriented chapter identifier (upstream tooling uses titles as
/// stable ids, e.g. "Chapter 5").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChapterId(String);

impl ChapterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChapterId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One spoken line in a chapter's dialogue track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueLine {
    pub speaker: String,
    pub line: String,
}

impl DialogueLine {
    pub fn new(speaker: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            line: line.into(),
        }
    }
}

/// A generated chapter as seen by the consistency engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    /// Causal position in the story; lower indices are established earlier.
    pub index: usize,
    pub title: String,
    /// The chapter's prose content.
    pub content: String,
    /// Entity names known to appear in this chapter.
    pub entities: Vec<String>,
    /// Dialogue lines inserted into this chapter.
    pub dialogue: Vec<DialogueLine>,
}

impl Chapter {
    pub fn new(id: impl Into<ChapterId>, index: usize, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            index,
            title: title.into(),
            content: String::new(),
            entities: Vec::new(),
            dialogue: Vec::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_entity(mut self, name: impl Into<String>) -> Self {
        self.entities.push(name.into());
        self
    }

    /// Whole-word, case-insensitive mention check against the chapter text.
    pub fn mentions(&self, name: &str) -> bool {
        contains_word(&self.content, name)
            || self.dialogue.iter().any(|l| contains_word(&l.line, name))
    }
}

impl From<String> for ChapterId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Whether the participants of a scene share a location or speak remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    /// Speakers are physically together.
    CoPresent,
    /// Speakers communicate at a distance (letters, sendings, visions).
    Remote,
}

/// A single beat of a chapter under drafting. Ephemeral: created per
/// drafting pass, discarded afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativePoint {
    pub chapter_id: ChapterId,
    /// Position of this beat within the chapter.
    pub index: usize,
    /// The beat's text.
    pub text: String,
    /// Text immediately surrounding the beat.
    pub local_context: String,
    /// Story-level context (arc summary, prior chapter synopsis).
    pub global_context: String,
    /// Characters present in the scene.
    pub scene_participants: BTreeSet<String>,
    pub channel: Channel,
}

impl NarrativePoint {
    pub fn new(chapter_id: impl Into<ChapterId>, index: usize, text: impl Into<String>) -> Self {
        Self {
            chapter_id: chapter_id.into(),
            index,
            text: text.into(),
            local_context: String::new(),
            global_context: String::new(),
            scene_participants: BTreeSet::new(),
            channel: Channel::CoPresent,
        }
    }

    pub fn with_local_context(mut self, context: impl Into<String>) -> Self {
        self.local_context = context.into();
        self
    }

    pub fn with_global_context(mut self, context: impl Into<String>) -> Self {
        self.global_context = context.into();
        self
    }

    pub fn with_participant(mut self, name: impl Into<String>) -> Self {
        self.scene_participants.insert(name.into());
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }
}

/// A plot fact that belongs to a later chapter and must not surface early.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FutureFact {
    /// Stable key used by the allowed-disclosure set.
    pub key: String,
    /// The restricted text; its appearance in earlier content is a leak.
    pub text: String,
}

impl FutureFact {
    pub fn new(key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            text: text.into(),
        }
    }
}

/// A fact the story has already established, with the phrasings that would
/// negate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstablishedFact {
    pub statement: String,
    /// Phrasings that contradict the statement if they appear in new content.
    pub negations: Vec<String>,
}

impl EstablishedFact {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            negations: Vec::new(),
        }
    }

    pub fn with_negation(mut self, phrasing: impl Into<String>) -> Self {
        self.negations.push(phrasing.into());
        self
    }
}

/// Knowledge a character must not display yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeRestriction {
    pub character: String,
    /// What the character must not know about.
    pub topic: String,
    /// Phrases whose appearance betrays the restricted knowledge.
    pub telltale_phrases: Vec<String>,
}

impl KnowledgeRestriction {
    pub fn new(character: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            character: character.into(),
            topic: topic.into(),
            telltale_phrases: Vec::new(),
        }
    }

    pub fn with_phrase(mut self, phrase: impl Into<String>) -> Self {
        self.telltale_phrases.push(phrase.into());
        self
    }
}

/// Everything the conflict detector is allowed to see about the current
/// scene. Assembled by the caller; the engine never fetches facts itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneContext {
    /// Entity names visible to the scene.
    pub entities: Vec<String>,
    /// Restricted future plot facts.
    pub future_facts: Vec<FutureFact>,
    /// Keys of future facts this scene is allowed to disclose.
    pub allowed_disclosures: BTreeSet<String>,
    /// Facts already established by earlier chapters.
    pub established_facts: Vec<EstablishedFact>,
    /// Character-knowledge restrictions active in this scene.
    pub knowledge_restrictions: Vec<KnowledgeRestriction>,
}

impl SceneContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, name: impl Into<String>) -> Self {
        self.entities.push(name.into());
        self
    }

    pub fn with_future_fact(mut self, fact: FutureFact) -> Self {
        self.future_facts.push(fact);
        self
    }

    pub fn with_allowed_disclosure(mut self, key: impl Into<String>) -> Self {
        self.allowed_disclosures.insert(key.into());
        self
    }

    pub fn with_established_fact(mut self, fact: EstablishedFact) -> Self {
        self.established_facts.push(fact);
        self
    }

    pub fn with_restriction(mut self, restriction: KnowledgeRestriction) -> Self {
        self.knowledge_restrictions.push(restriction);
        self
    }
}

/// An upstream edit to a chapter, as delivered to the consistency engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub chapter_id: ChapterId,
    /// The chapter content before the edit.
    pub previous_content: String,
    /// The chapter content after the edit.
    pub new_content: String,
    /// Why the edit happened (operator note, upstream stage name).
    pub cause: String,
    /// Seconds-since-epoch timestamp, assigned at construction.
    pub timestamp: String,
}

impl ChangeEvent {
    pub fn new(
        chapter_id: impl Into<ChapterId>,
        previous_content: impl Into<String>,
        new_content: impl Into<String>,
        cause: impl Into<String>,
    ) -> Self {
        Self {
            chapter_id: chapter_id.into(),
            previous_content: previous_content.into(),
            new_content: new_content.into(),
            cause: cause.into(),
            timestamp: epoch_timestamp(),
        }
    }

    /// The changed span of the new content, expanded to sentence
    /// boundaries so the subjects of an edited sentence stay inside the
    /// region even when only a few words changed.
    ///
    /// Falls back to the whole new content when the edit replaced
    /// everything.
    pub fn diff_region(&self) -> &str {
        diff_region(&self.previous_content, &self.new_content)
    }
}

/// The ordered chapter sequence for one story-generation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Story {
    chapters: Vec<Chapter>,
}

impl Story {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chapter, keeping the sequence sorted by causal index.
    pub fn push(&mut self, chapter: Chapter) {
        self.chapters.push(chapter);
        self.chapters.sort_by_key(|c| c.index);
    }

    pub fn with_chapter(mut self, chapter: Chapter) -> Self {
        self.push(chapter);
        self
    }

    pub fn get(&self, id: &ChapterId) -> Option<&Chapter> {
        self.chapters.iter().find(|c| &c.id == id)
    }

    pub fn get_mut(&mut self, id: &ChapterId) -> Option<&mut Chapter> {
        self.chapters.iter_mut().find(|c| &c.id == id)
    }

    pub fn by_index(&self, index: usize) -> Option<&Chapter> {
        self.chapters.iter().find(|c| c.index == index)
    }

    /// Chapters strictly after the given causal index, in order.
    pub fn after(&self, index: usize) -> impl Iterator<Item = &Chapter> {
        self.chapters.iter().filter(move |c| c.index > index)
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }
}

/// Whole-word, case-insensitive containment check.
pub(crate) fn contains_word(text: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    let text = text.to_lowercase();
    let word = word.to_lowercase();

    let mut start = 0;
    while let Some(pos) = text[start..].find(&word) {
        let begin = start + pos;
        let end = begin + word.len();
        let before_ok = begin == 0
            || !text[..begin]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric());
        let after_ok = end == text.len()
            || !text[end..].chars().next().is_some_and(|c| c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = begin + 1;
    }
    false
}

/// Case-insensitive phrase containment (no word-boundary requirement).
pub(crate) fn contains_phrase(text: &str, phrase: &str) -> bool {
    !phrase.is_empty() && text.to_lowercase().contains(&phrase.to_lowercase())
}

/// Strip the common prefix and suffix between two versions of a text,
/// then expand the changed span of the new version outwards to sentence
/// boundaries.
pub(crate) fn diff_region<'a>(previous: &str, new: &'a str) -> &'a str {
    if previous == new {
        return "";
    }

    let prefix = previous
        .char_indices()
        .zip(new.char_indices())
        .take_while(|((_, a), (_, b))| a == b)
        .count();
    let prefix_bytes = new
        .char_indices()
        .nth(prefix)
        .map(|(i, _)| i)
        .unwrap_or(new.len());

    let prev_rest: Vec<char> = previous[prefix_bytes.min(previous.len())..].chars().collect();
    let new_rest: Vec<char> = new[prefix_bytes..].chars().collect();
    let suffix = prev_rest
        .iter()
        .rev()
        .zip(new_rest.iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let end_chars = new_rest.len() - suffix;
    let end_bytes = prefix_bytes
        + new[prefix_bytes..]
            .char_indices()
            .nth(end_chars)
            .map(|(i, _)| i)
            .unwrap_or(new.len() - prefix_bytes);

    // Expand to sentence boundaries.
    let start = new[..prefix_bytes]
        .rfind(['.', '!', '?', '\n'])
        .map(|i| i + 1)
        .unwrap_or(0);
    let end = new[end_bytes..]
        .find(['.', '!', '?', '\n'])
        .map(|i| end_bytes + i + 1)
        .unwrap_or(new.len());

    &new[start..end]
}

/// Current timestamp as seconds since the epoch.
pub(crate) fn epoch_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", now.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chapter_mentions() {
        let chapter = Chapter::new("Chapter 2", 1, "The Road")
            .with_content("Mira walked the north road while Aldric slept.");

        assert!(chapter.mentions("Mira"));
        assert!(chapter.mentions("aldric"));
        assert!(!chapter.mentions("Mir"));
        assert!(!chapter.mentions("Baron"));
    }

    #[test]
    fn test_mentions_in_dialogue() {
        let mut chapter = Chapter::new("Chapter 3", 2, "The Inn");
        chapter
            .dialogue
            .push(DialogueLine::new("Innkeep", "Mira passed through yesterday."));

        assert!(chapter.mentions("Mira"));
    }

    #[test]
    fn test_story_causal_order() {
        let story = Story::new()
            .with_chapter(Chapter::new("Chapter 3", 2, "Three"))
            .with_chapter(Chapter::new("Chapter 1", 0, "One"))
            .with_chapter(Chapter::new("Chapter 2", 1, "Two"));

        let ids: Vec<_> = story.chapters().iter().map(|c| c.index).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        let after: Vec<_> = story.after(0).map(|c| c.index).collect();
        assert_eq!(after, vec![1, 2]);
    }

    #[test]
    fn test_diff_region_expands_to_sentence() {
        let previous = "The baron greeted them coldly and left.";
        let new = "The baron greeted them warmly and left.";
        assert_eq!(diff_region(previous, new), new);
    }

    #[test]
    fn test_diff_region_limited_to_changed_sentence() {
        let previous = "Dawn broke. The baron greeted them coldly. Birds sang.";
        let new = "Dawn broke. The baron greeted them warmly. Birds sang.";
        assert_eq!(diff_region(previous, new), " The baron greeted them warmly.");
    }

    #[test]
    fn test_diff_region_append() {
        let previous = "The gate stood open.";
        let new = "The gate stood open. Mira slipped inside.";
        assert!(diff_region(previous, new).contains("Mira slipped inside."));
    }

    #[test]
    fn test_diff_region_unchanged() {
        assert_eq!(diff_region("same", "same"), "");
    }

    #[test]
    fn test_diff_region_full_replacement() {
        let region = diff_region("abc", "xyz");
        assert_eq!(region, "xyz");
    }

    #[test]
    fn test_contains_word_boundaries() {
        assert!(contains_word("Mira spoke.", "mira"));
        assert!(contains_word("Then Mira, laughing, left.", "Mira"));
        assert!(!contains_word("Miranda spoke.", "Mira"));
        assert!(!contains_word("admiral", "mira"));
        assert!(!contains_word("anything", ""));
    }

    #[test]
    fn test_change_event_diff() {
        let event = ChangeEvent::new(
            "Chapter 3",
            "Mira kept her silence about the ledger.",
            "Mira spoke openly of the betrayal at the ford.",
            "operator edit",
        );
        assert!(event.diff_region().contains("betrayal"));
    }
}
