use std::borrow::Cow;
use std::sync::Arc;

use super::policy::CompiledPolicy;
use super::sanitize::detection_passes;
use super::types::{CrisisClassification, DetectionLayer, DetectionPass};

/// Pattern layer of crisis detection. Pure: no I/O, no shared state.
#[derive(Debug, Clone)]
pub struct CrisisDetector {
    policy: Arc<CompiledPolicy>,
}

impl CrisisDetector {
    pub fn new(policy: Arc<CompiledPolicy>) -> Self {
        Self { policy }
    }

    /// Classify one message.
    ///
    /// Rules run in policy order; for each rule every pass (raw, normalized,
    /// leet) is tried, so rule priority decides the reason code. Idioms are
    /// masked per pass before matching. Never fails: an unmatched message is
    /// `triggered = false, confidence = 0`.
    pub fn classify(&self, text: &str) -> CrisisClassification {
        if text.trim().is_empty() {
            return CrisisClassification::clear();
        }

        let passes: Vec<(DetectionPass, Cow<'_, str>)> = detection_passes(text, &self.policy)
            .into_iter()
            .map(|(pass, variant)| (pass, Cow::Owned(mask_idioms(&variant, &self.policy))))
            .collect();

        for rule in &self.policy.rules {
            for (pass, variant) in &passes {
                if rule.regex.is_match(variant) {
                    let confidence = rule.confidence * pass.weight();
                    tracing::warn!(
                        rule_id = %rule.id,
                        reason = %rule.reason,
                        pass = ?pass,
                        confidence,
                        "Crisis pattern matched"
                    );
                    return CrisisClassification {
                        triggered: true,
                        reason_code: rule.reason,
                        matched_pattern: Some(rule.id.clone()),
                        confidence,
                        layer: DetectionLayer::Pattern,
                    };
                }
            }
        }

        CrisisClassification::clear()
    }
}

/// Blank out figurative phrases ("killing time", "could die of embarrassment")
/// so crisis rules cannot match inside them. The rest of the text is kept,
/// so a real crisis phrase elsewhere in the message still matches.
fn mask_idioms(text: &str, policy: &CompiledPolicy) -> String {
    let mut masked = text.to_string();
    for idiom in &policy.idioms {
        if let Cow::Owned(replaced) = idiom.replace_all(&masked, " ") {
            masked = replaced;
        }
    }
    masked
}
