//! Affordance classification for narrative points.
//!
//! Asks the judgment service to label a beat along four enumerated
//! dimensions. The call never raises: every missing or out-of-domain value
//! degrades to that dimension's documented fail-safe default, and each
//! substitution is recorded so the audit trail shows what was real and
//! what was substituted.

use crate::judge::{JudgmentRequest, JudgmentService, LabelField};
use crate::labels::{AffordanceLabels, InfoValue, Intensity, Pacing, Presence};
use crate::story::{Channel, NarrativePoint};
use std::sync::Arc;

/// A classification outcome: the (possibly degraded) labels plus a note for
/// every fail-safe substitution that was applied.
#[derive(Debug, Clone)]
pub struct ClassifiedAffordance {
    pub labels: AffordanceLabels,
    /// One entry per substituted dimension, e.g.
    /// `"presence: service value 'MAYBE' outside domain"`.
    pub substitutions: Vec<String>,
}

impl ClassifiedAffordance {
    /// Whether any dimension was substituted.
    pub fn degraded(&self) -> bool {
        !self.substitutions.is_empty()
    }
}

/// Classifies narrative points into dialogue-affordance labels.
pub struct AffordanceClassifier {
    judge: Arc<dyn JudgmentService>,
}

impl AffordanceClassifier {
    pub fn new(judge: Arc<dyn JudgmentService>) -> Self {
        Self { judge }
    }

    /// Classify one narrative point. Total: service failure degrades to the
    /// all-fail-safe label set instead of returning an error.
    pub async fn classify(&self, point: &NarrativePoint) -> ClassifiedAffordance {
        let request = Self::build_request(point);

        let response = match self.judge.judge(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    chapter = %point.chapter_id,
                    point = point.index,
                    error = %err,
                    "affordance judgment unavailable, substituting fail-safe labels"
                );
                return ClassifiedAffordance {
                    labels: AffordanceLabels::fail_safe()
                        .with_justification("fail_safe", err.to_string()),
                    substitutions: vec![format!("all dimensions: {err}")],
                };
            }
        };

        let mut substitutions = Vec::new();

        let presence = match response.value("presence").and_then(Presence::parse_label) {
            Some(value) => value,
            None => {
                substitutions.push(describe_substitution("presence", response.value("presence")));
                Presence::fail_safe()
            }
        };
        let intensity = match response.value("intensity").and_then(Intensity::parse_label) {
            Some(value) => value,
            None => {
                substitutions.push(describe_substitution("intensity", response.value("intensity")));
                Intensity::fail_safe()
            }
        };
        let info = match response.value("info").and_then(InfoValue::parse_label) {
            Some(value) => value,
            None => {
                substitutions.push(describe_substitution("info", response.value("info")));
                InfoValue::fail_safe()
            }
        };
        let pacing = match response.value("pacing").and_then(Pacing::parse_label) {
            Some(value) => value,
            None => {
                substitutions.push(describe_substitution("pacing", response.value("pacing")));
                Pacing::fail_safe()
            }
        };

        for substitution in &substitutions {
            tracing::warn!(
                chapter = %point.chapter_id,
                point = point.index,
                %substitution,
                "affordance label substituted with fail-safe default"
            );
        }

        let mut labels = AffordanceLabels::new(presence, intensity, info, pacing);
        if let Some(rationale) = response.value("rationale") {
            labels = labels.with_justification("rationale", rationale);
        }
        for substitution in &substitutions {
            let dimension = substitution
                .split(':')
                .next()
                .unwrap_or("unknown")
                .to_string();
            labels = labels.with_justification(dimension, substitution.clone());
        }

        ClassifiedAffordance {
            labels,
            substitutions,
        }
    }

    fn build_request(point: &NarrativePoint) -> JudgmentRequest {
        let channel = match point.channel {
            Channel::CoPresent => "the participants share a location",
            Channel::Remote => "the participants communicate at a distance",
        };

        let mut context = format!("## Beat\n{}\n", point.text);
        if !point.local_context.is_empty() {
            context.push_str(&format!("\n## Surrounding text\n{}\n", point.local_context));
        }
        if !point.global_context.is_empty() {
            context.push_str(&format!("\n## Story context\n{}\n", point.global_context));
        }
        if !point.scene_participants.is_empty() {
            let participants: Vec<_> = point.scene_participants.iter().cloned().collect();
            context.push_str(&format!("\n## Participants\n{}\n", participants.join(", ")));
        }
        context.push_str(&format!("\n## Channel\n{channel}\n"));

        JudgmentRequest::new(
            "Label this narrative beat for dialogue affordance. Judge only \
             what the text supports; do not invent events.",
        )
        .with_field(LabelField::new(
            "presence",
            "Does the beat plausibly admit a dialogue exchange?",
            to_owned(Presence::variants()),
        ))
        .with_field(LabelField::new(
            "intensity",
            "How dramatically charged is the beat?",
            to_owned(Intensity::variants()),
        ))
        .with_field(LabelField::new(
            "info",
            "How much new information would an exchange here carry?",
            to_owned(InfoValue::variants()),
        ))
        .with_field(LabelField::new(
            "pacing",
            "Does pacing favor an exchange right now?",
            to_owned(Pacing::variants()),
        ))
        .with_field(LabelField::new(
            "rationale",
            "One sentence explaining the labels.",
            Vec::new(),
        ))
        .with_context(context)
    }
}

fn to_owned(variants: &[&str]) -> Vec<String> {
    variants.iter().map(|v| v.to_string()).collect()
}

fn describe_substitution(dimension: &str, value: Option<&str>) -> String {
    match value {
        Some(value) => format!("{dimension}: service value '{value}' outside domain"),
        None => format!("{dimension}: missing from service response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockJudge;

    fn point() -> NarrativePoint {
        NarrativePoint::new("Chapter 1", 0, "Mira hesitated at the gate.")
            .with_participant("Mira")
            .with_participant("Gatekeeper")
    }

    #[tokio::test]
    async fn test_classify_clean_response() {
        let judge = Arc::new(MockJudge::new());
        judge.queue_labels([
            ("presence", "AFFIRMED"),
            ("intensity", "MED"),
            ("info", "HIGH"),
            ("pacing", "ENCOURAGE"),
            ("rationale", "A tense doorway confrontation."),
        ]);

        let classifier = AffordanceClassifier::new(judge);
        let outcome = classifier.classify(&point()).await;

        assert!(!outcome.degraded());
        assert_eq!(outcome.labels.presence, Presence::Affirmed);
        assert_eq!(outcome.labels.intensity, Intensity::Med);
        assert_eq!(outcome.labels.info, InfoValue::High);
        assert_eq!(outcome.labels.pacing, Pacing::Encourage);
        assert!(outcome.labels.justification.contains_key("rationale"));
    }

    #[tokio::test]
    async fn test_out_of_domain_value_degrades_one_dimension() {
        let judge = Arc::new(MockJudge::new());
        judge.queue_labels([
            ("presence", "MAYBE"),
            ("intensity", "HIGH"),
            ("info", "LOW"),
            ("pacing", "HOLD"),
        ]);

        let classifier = AffordanceClassifier::new(judge);
        let outcome = classifier.classify(&point()).await;

        assert!(outcome.degraded());
        assert_eq!(outcome.substitutions.len(), 1);
        assert_eq!(outcome.labels.presence, Presence::Uncertain);
        assert_eq!(outcome.labels.intensity, Intensity::High);
    }

    #[tokio::test]
    async fn test_missing_field_degrades() {
        let judge = Arc::new(MockJudge::new());
        judge.queue_labels([("presence", "DENIED")]);

        let classifier = AffordanceClassifier::new(judge);
        let outcome = classifier.classify(&point()).await;

        assert_eq!(outcome.labels.presence, Presence::Denied);
        assert_eq!(outcome.labels.intensity, Intensity::Low);
        assert_eq!(outcome.labels.info, InfoValue::Low);
        assert_eq!(outcome.labels.pacing, Pacing::Hold);
        assert_eq!(outcome.substitutions.len(), 3);
    }

    #[tokio::test]
    async fn test_service_failure_degrades_everything() {
        let judge = Arc::new(MockJudge::unavailable());

        let classifier = AffordanceClassifier::new(judge);
        let outcome = classifier.classify(&point()).await;

        assert!(outcome.degraded());
        assert_eq!(outcome.labels.presence, Presence::Uncertain);
        assert_eq!(outcome.labels.intensity, Intensity::Low);
        assert_eq!(outcome.labels.info, InfoValue::Low);
        assert_eq!(outcome.labels.pacing, Pacing::Hold);
        assert!(outcome.labels.justification.contains_key("fail_safe"));
    }
}
