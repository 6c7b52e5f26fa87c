//! Affordance label domains for dialogue-insertion judgments.
//!
//! Each dimension is a closed enumerated domain with a documented fail-safe
//! default. Values returned by the judgment service are parsed against the
//! domain; anything missing or out-of-domain degrades to the fail-safe
//! rather than failing the call.

use saga_macros::Label;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whether the narrative point plausibly admits a dialogue exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Label)]
pub enum Presence {
    /// The point clearly supports an exchange.
    Affirmed,
    /// The point may or may not support an exchange.
    #[label(default)]
    Uncertain,
    /// The point does not support an exchange.
    Denied,
}

/// How dramatically charged the point is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Label)]
pub enum Intensity {
    High,
    Med,
    #[label(default)]
    Low,
}

/// How much new information an exchange here would carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Label)]
pub enum InfoValue {
    High,
    Med,
    #[label(default)]
    Low,
}

/// Whether pacing favors inserting an exchange right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Label)]
pub enum Pacing {
    Encourage,
    #[label(default)]
    Hold,
}

/// The four affordance labels for one narrative point, plus per-dimension
/// justification text from the judgment service.
///
/// Immutable once produced: downstream code reads the snapshot, it never
/// edits it. A superseding classification is a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffordanceLabels {
    pub presence: Presence,
    pub intensity: Intensity,
    pub info: InfoValue,
    pub pacing: Pacing,
    /// Dimension name → rationale text. Also records fail-safe
    /// substitutions under the dimension they replaced.
    pub justification: BTreeMap<String, String>,
}

impl AffordanceLabels {
    /// Create a label set with an empty justification map.
    pub fn new(presence: Presence, intensity: Intensity, info: InfoValue, pacing: Pacing) -> Self {
        Self {
            presence,
            intensity,
            info,
            pacing,
            justification: BTreeMap::new(),
        }
    }

    /// The all-defaults label set used when the judgment call fails
    /// entirely.
    pub fn fail_safe() -> Self {
        Self::new(
            Presence::fail_safe(),
            Intensity::fail_safe(),
            InfoValue::fail_safe(),
            Pacing::fail_safe(),
        )
    }

    /// Attach a justification for one dimension.
    pub fn with_justification(mut self, dimension: impl Into<String>, text: impl Into<String>) -> Self {
        self.justification.insert(dimension.into(), text.into());
        self
    }

    /// Compact one-line rendering for reason traces and logs.
    pub fn summary(&self) -> String {
        format!(
            "presence={} intensity={} info={} pacing={}",
            self.presence.label(),
            self.intensity.label(),
            self.info.label(),
            self.pacing.label()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_labels() {
        assert_eq!(Presence::Affirmed.label(), "AFFIRMED");
        assert_eq!(Intensity::Med.label(), "MED");
        assert_eq!(InfoValue::High.label(), "HIGH");
        assert_eq!(Pacing::Encourage.label(), "ENCOURAGE");
    }

    #[test]
    fn test_domains_complete() {
        assert_eq!(Presence::variants(), &["AFFIRMED", "UNCERTAIN", "DENIED"]);
        assert_eq!(Intensity::variants(), &["HIGH", "MED", "LOW"]);
        assert_eq!(InfoValue::variants(), &["HIGH", "MED", "LOW"]);
        assert_eq!(Pacing::variants(), &["ENCOURAGE", "HOLD"]);
    }

    #[test]
    fn test_lenient_parse() {
        assert_eq!(Presence::parse_label(" denied "), Some(Presence::Denied));
        assert_eq!(Intensity::parse_label("high"), Some(Intensity::High));
        assert_eq!(Pacing::parse_label("HOLD"), Some(Pacing::Hold));
        assert_eq!(Presence::parse_label("MAYBE"), None);
    }

    #[test]
    fn test_fail_safe_defaults() {
        assert_eq!(Presence::fail_safe(), Presence::Uncertain);
        assert_eq!(Intensity::fail_safe(), Intensity::Low);
        assert_eq!(InfoValue::fail_safe(), InfoValue::Low);
        assert_eq!(Pacing::fail_safe(), Pacing::Hold);

        let labels = AffordanceLabels::fail_safe();
        assert_eq!(labels.presence, Presence::Uncertain);
        assert_eq!(labels.pacing, Pacing::Hold);
    }

    #[test]
    fn test_schema_fragment() {
        let schema = Presence::schema();
        assert_eq!(schema["type"], "string");
        let domain = schema["enum"].as_array().unwrap();
        assert_eq!(domain.len(), 3);
        assert!(domain.iter().any(|v| v == "UNCERTAIN"));
    }

    #[test]
    fn test_summary_line() {
        let labels = AffordanceLabels::new(
            Presence::Affirmed,
            Intensity::Med,
            InfoValue::High,
            Pacing::Encourage,
        );
        assert_eq!(
            labels.summary(),
            "presence=AFFIRMED intensity=MED info=HIGH pacing=ENCOURAGE"
        );
    }
}
