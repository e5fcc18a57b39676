//! Emotion labels, modalities, and the wire signal type.
//!
//! Downstream consumers contract on a four-class emotion enum. The external
//! speech classifier emits nine classes; the mapping here collapses them and
//! deliberately drops the neutral-ish remainder so a fifth label can never
//! reach storage or aggregation.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The four-class emotion contract shared with downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmotionLabel {
    Angry,
    Sad,
    Happy,
    Fear,
}

impl EmotionLabel {
    /// All labels, in the fixed order used for deterministic tie-breaks.
    pub const ALL: [EmotionLabel; 4] = [
        EmotionLabel::Angry,
        EmotionLabel::Sad,
        EmotionLabel::Happy,
        EmotionLabel::Fear,
    ];

    /// Canonical wire/storage spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            EmotionLabel::Angry => "Angry",
            EmotionLabel::Sad => "Sad",
            EmotionLabel::Happy => "Happy",
            EmotionLabel::Fear => "Fear",
        }
    }

    /// Map a raw nine-class classifier label to the four-class contract.
    ///
    /// Returns `None` for neutral/other/unknown — those chunks are dropped
    /// at the worker and never persisted.
    pub fn from_classifier(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "angry" | "disgusted" => Some(EmotionLabel::Angry),
            "sad" => Some(EmotionLabel::Sad),
            "happy" => Some(EmotionLabel::Happy),
            "fearful" | "surprised" => Some(EmotionLabel::Fear),
            _ => None,
        }
    }

    /// Normalize a label read back from the store.
    ///
    /// The speech table accepts both four-class and raw classifier labels
    /// (including legacy three-letter short codes); readers normalize and
    /// filter anything unmappable.
    pub fn from_stored(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "ang" | "angry" | "dis" | "disgusted" => Some(EmotionLabel::Angry),
            "sad" => Some(EmotionLabel::Sad),
            "hap" | "happy" => Some(EmotionLabel::Happy),
            "fea" | "fear" | "fearful" | "sur" | "surprised" => Some(EmotionLabel::Fear),
            _ => None,
        }
    }
}

impl std::fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Speech,
    Face,
    Vitals,
}

impl Modality {
    /// All modalities, in generation order.
    pub const ALL: [Modality; 3] = [Modality::Speech, Modality::Face, Modality::Vitals];

    /// Canonical wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Speech => "speech",
            Modality::Face => "face",
            Modality::Vitals => "vitals",
        }
    }

    /// Parse a modality name. Accepts the canonical names plus the legacy
    /// per-model aliases ("ser", "fer") still used by older tooling.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "speech" | "ser" => Some(Modality::Speech),
            "face" | "fer" => Some(Modality::Face),
            "vitals" => Some(Modality::Vitals),
            _ => None,
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One emotion signal on the external boundary: exchanged over HTTP and
/// written to the per-modality store tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSignal {
    pub user_id: Uuid,
    /// ISO 8601 with offset; bare timestamps on the wire are read as UTC+8.
    pub timestamp: DateTime<FixedOffset>,
    pub modality: Modality,
    pub emotion_label: EmotionLabel,
    /// Confidence in `0.0..=1.0`.
    pub confidence: f32,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn classifier_mapping_collapses_to_four_classes() {
        assert_eq!(
            EmotionLabel::from_classifier("angry"),
            Some(EmotionLabel::Angry)
        );
        assert_eq!(
            EmotionLabel::from_classifier("disgusted"),
            Some(EmotionLabel::Angry)
        );
        assert_eq!(EmotionLabel::from_classifier("sad"), Some(EmotionLabel::Sad));
        assert_eq!(
            EmotionLabel::from_classifier("happy"),
            Some(EmotionLabel::Happy)
        );
        assert_eq!(
            EmotionLabel::from_classifier("fearful"),
            Some(EmotionLabel::Fear)
        );
        assert_eq!(
            EmotionLabel::from_classifier("surprised"),
            Some(EmotionLabel::Fear)
        );
    }

    #[test]
    fn neutral_class_inputs_are_dropped() {
        for raw in ["neutral", "other", "unknown", "", "calm"] {
            assert_eq!(EmotionLabel::from_classifier(raw), None, "raw={raw}");
        }
    }

    #[test]
    fn classifier_mapping_is_case_insensitive() {
        assert_eq!(
            EmotionLabel::from_classifier("  Happy "),
            Some(EmotionLabel::Happy)
        );
        assert_eq!(
            EmotionLabel::from_classifier("ANGRY"),
            Some(EmotionLabel::Angry)
        );
    }

    #[test]
    fn stored_labels_normalize_across_formats() {
        // Four-class, raw nine-class, and legacy short codes all map.
        assert_eq!(EmotionLabel::from_stored("Happy"), Some(EmotionLabel::Happy));
        assert_eq!(EmotionLabel::from_stored("hap"), Some(EmotionLabel::Happy));
        assert_eq!(EmotionLabel::from_stored("ang"), Some(EmotionLabel::Angry));
        assert_eq!(EmotionLabel::from_stored("fearful"), Some(EmotionLabel::Fear));
        assert_eq!(EmotionLabel::from_stored("sur"), Some(EmotionLabel::Fear));
        assert_eq!(EmotionLabel::from_stored("neu"), None);
        assert_eq!(EmotionLabel::from_stored("neutral"), None);
    }

    #[test]
    fn modality_parse_accepts_legacy_aliases() {
        assert_eq!(Modality::parse("speech"), Some(Modality::Speech));
        assert_eq!(Modality::parse("ser"), Some(Modality::Speech));
        assert_eq!(Modality::parse("FER"), Some(Modality::Face));
        assert_eq!(Modality::parse("vitals"), Some(Modality::Vitals));
        assert_eq!(Modality::parse("gait"), None);
    }

    #[test]
    fn signal_serializes_with_canonical_names() {
        let signal = ModelSignal {
            user_id: Uuid::nil(),
            timestamp: crate::clock::parse_wire_timestamp("2025-03-01T10:00:00+08:00").unwrap(),
            modality: Modality::Face,
            emotion_label: EmotionLabel::Fear,
            confidence: 0.81,
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["modality"], "face");
        assert_eq!(json["emotion_label"], "Fear");
        assert!(
            json["timestamp"]
                .as_str()
                .unwrap()
                .ends_with("+08:00")
        );
    }
}
