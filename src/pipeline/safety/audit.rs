use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::CrisisClassification;
use crate::models::MessageRole;

/// One record per message passing through the safety pipeline.
///
/// `raw_content` is kept verbatim so a reviewer can audit exactly what was
/// said. Sinks decide what to persist; the tracing sink drops it.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub conversation_id: Option<String>,
    pub role: MessageRole,
    pub raw_content: String,
    pub classification: Option<CrisisClassification>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(role: MessageRole, raw_content: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            role,
            raw_content: raw_content.into(),
            classification: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_classification(mut self, classification: CrisisClassification) -> Self {
        self.classification = Some(classification);
        self
    }
}

/// Destination for audit entries. Recording must not block the chat turn.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Logs audit metadata through `tracing`. Message text is never logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        let triggered = entry.classification.as_ref().is_some_and(|c| c.triggered);
        let rule = entry
            .classification
            .as_ref()
            .and_then(|c| c.matched_pattern.as_deref())
            .unwrap_or("-");
        tracing::info!(
            target: "cbt_safety_lib::audit",
            conversation_id = entry.conversation_id.as_deref().unwrap_or("-"),
            role = %entry.role,
            content_len = entry.raw_content.len(),
            crisis = triggered,
            rule,
            recorded_at = %entry.recorded_at.to_rfc3339(),
            "Message audited"
        );
    }
}
