use std::time::Duration;

use super::keywords::CrisisDetector;
use super::types::{
    CrisisClassification, DetectionLayer, SafetyError, SecondaryClassifier, SecondaryVerdict,
};
use crate::config::DEFAULT_SECONDARY_TIMEOUT;

/// Placeholder classifier for gates running on patterns alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecondary;

impl SecondaryClassifier for NoSecondary {
    fn assess(
        &self,
        _text: &str,
    ) -> impl std::future::Future<Output = Result<SecondaryVerdict, SafetyError>> + Send {
        async { Err(SafetyError::SecondaryUnavailable("not configured".into())) }
    }
}

/// Two-layer crisis check run on every user message before it is sent.
///
/// The pattern layer is authoritative for positives: a secondary verdict can
/// only add a detection, never clear one. Secondary failures and timeouts
/// resolve to the pattern result.
pub struct CrisisGate<S: SecondaryClassifier = NoSecondary> {
    detector: CrisisDetector,
    secondary: Option<S>,
    timeout: Duration,
}

impl CrisisGate<NoSecondary> {
    /// Pattern-only gate.
    pub fn new(detector: CrisisDetector) -> Self {
        Self {
            detector,
            secondary: None,
            timeout: DEFAULT_SECONDARY_TIMEOUT,
        }
    }
}

impl<S: SecondaryClassifier> CrisisGate<S> {
    pub fn with_secondary(detector: CrisisDetector, secondary: S, timeout: Duration) -> Self {
        Self {
            detector,
            secondary: Some(secondary),
            timeout,
        }
    }

    pub fn detector(&self) -> &CrisisDetector {
        &self.detector
    }

    pub async fn classify(&self, text: &str) -> CrisisClassification {
        let pattern = self.detector.classify(text);
        if pattern.triggered {
            return pattern;
        }

        let Some(secondary) = &self.secondary else {
            return pattern;
        };

        let verdict = match tokio::time::timeout(self.timeout, secondary.assess(text)).await {
            Ok(result) => result,
            Err(_) => Err(SafetyError::SecondaryTimeout(self.timeout.as_millis())),
        };

        match verdict {
            Ok(v) if v.triggered => {
                tracing::warn!(
                    reason = %v.reason,
                    confidence = v.confidence,
                    "Secondary classifier flagged message"
                );
                CrisisClassification {
                    triggered: true,
                    reason_code: v.reason,
                    matched_pattern: Some("secondary".into()),
                    confidence: v.confidence.clamp(0.0, 1.0),
                    layer: DetectionLayer::Secondary,
                }
            }
            Ok(_) => pattern,
            Err(e) => {
                tracing::warn!(error = %e, "Secondary classifier failed, using pattern result");
                pattern
            }
        }
    }
}
