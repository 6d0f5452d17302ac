use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::CrisisReason;

/// Outcome of crisis classification for one message.
///
/// Produced fresh per message and never cached across turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisisClassification {
    pub triggered: bool,
    pub reason_code: CrisisReason,
    /// Id of the policy rule that matched (never the user's text).
    pub matched_pattern: Option<String>,
    pub confidence: f32,
    /// Which detection layer produced the verdict.
    pub layer: DetectionLayer,
}

impl CrisisClassification {
    /// The worst-case answer: nothing matched.
    pub fn clear() -> Self {
        Self {
            triggered: false,
            reason_code: CrisisReason::None,
            matched_pattern: None,
            confidence: 0.0,
            layer: DetectionLayer::Pattern,
        }
    }
}

/// Which layer of the detector decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionLayer {
    Pattern,
    Secondary,
}

/// Text variant a crisis rule matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionPass {
    /// Lowercased input with invisible characters removed.
    Raw,
    /// Homoglyphs folded and spaced/punctuated letters collapsed.
    Normalized,
    /// Normalized text with leetspeak digits/symbols reversed.
    Leet,
}

impl DetectionPass {
    /// Confidence multiplier: every normalization step adds false-positive risk.
    pub fn weight(self) -> f32 {
        match self {
            Self::Raw => 1.0,
            Self::Normalized => 0.9,
            Self::Leet => 0.8,
        }
    }
}

/// Verdict returned by the optional model-based classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondaryVerdict {
    pub triggered: bool,
    #[serde(default = "default_secondary_reason")]
    pub reason: CrisisReason,
    #[serde(default)]
    pub confidence: f32,
}

fn default_secondary_reason() -> CrisisReason {
    CrisisReason::GeneralCrisis
}

/// Safety layer errors. Only the secondary classifier seam can fail.
#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("Secondary classifier unavailable: {0}")]
    SecondaryUnavailable(String),

    #[error("Secondary classifier timed out after {0} ms")]
    SecondaryTimeout(u128),
}

/// Optional second opinion on user text, typically backed by an LLM.
pub trait SecondaryClassifier: Send + Sync {
    fn assess(
        &self,
        text: &str,
    ) -> impl Future<Output = Result<SecondaryVerdict, SafetyError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_classification_is_not_triggered() {
        let c = CrisisClassification::clear();
        assert!(!c.triggered);
        assert_eq!(c.reason_code, CrisisReason::None);
        assert_eq!(c.confidence, 0.0);
        assert!(c.matched_pattern.is_none());
    }

    #[test]
    fn pass_weights_decrease_with_normalization() {
        assert!(DetectionPass::Raw.weight() > DetectionPass::Normalized.weight());
        assert!(DetectionPass::Normalized.weight() > DetectionPass::Leet.weight());
    }

    #[test]
    fn secondary_verdict_defaults_reason() {
        let v: SecondaryVerdict = serde_json::from_str(r#"{"triggered":true}"#).unwrap();
        assert_eq!(v.reason, CrisisReason::GeneralCrisis);
        assert_eq!(v.confidence, 0.0);
    }

    #[test]
    fn classification_serializes_snake_case() {
        let json = serde_json::to_string(&CrisisClassification::clear()).unwrap();
        assert!(json.contains("\"reason_code\":\"none\""));
        assert!(json.contains("\"layer\":\"pattern\""));
    }
}
