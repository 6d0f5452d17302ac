//! Per-message pipeline.
//!
//! User input: crisis gate first; a positive result short-circuits the turn to
//! the safety UI and the text is never forwarded to the agent.
//! Agent reply: structured-output extraction and sanitization, then a typed
//! metadata view and the save-offer decision.
//!
//! Every message is handed to the audit sink with its raw content.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::models::{Message, MessageRole};
use crate::pipeline::safety::audit::{AuditEntry, AuditSink, TracingAuditSink};
use crate::pipeline::safety::escalation::{crisis_response, CrisisResponse};
use crate::pipeline::safety::keywords::CrisisDetector;
use crate::pipeline::safety::orchestrator::{CrisisGate, NoSecondary};
use crate::pipeline::safety::policy::CompiledPolicy;
use crate::pipeline::safety::types::{CrisisClassification, SecondaryClassifier};
use crate::pipeline::stability::StabilityStats;
use crate::pipeline::structuring::{extract_display_text, should_offer_save, ReplyMetadata};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Outcome for one piece of user input.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UserTurn {
    /// Show the safety UI. Do not send the text to the agent.
    Crisis {
        message: Message,
        classification: CrisisClassification,
        response: CrisisResponse,
    },
    /// Safe to send to the agent.
    Forward {
        message: Message,
        classification: CrisisClassification,
    },
}

impl UserTurn {
    pub fn message(&self) -> &Message {
        match self {
            Self::Crisis { message, .. } | Self::Forward { message, .. } => message,
        }
    }

    pub fn should_forward(&self) -> bool {
        matches!(self, Self::Forward { .. })
    }
}

/// Outcome for one agent reply.
#[derive(Debug, Clone, Serialize)]
pub struct AssistantTurn {
    pub message: Message,
    pub reply_metadata: Option<ReplyMetadata>,
    pub offer_save: bool,
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

pub struct MessageProcessor<S: SecondaryClassifier = NoSecondary> {
    policy: Arc<CompiledPolicy>,
    gate: CrisisGate<S>,
    audit: Arc<dyn AuditSink>,
    lang: String,
}

impl MessageProcessor<NoSecondary> {
    /// Pattern-only crisis detection, tracing audit sink, English messages.
    pub fn new(policy: Arc<CompiledPolicy>) -> Self {
        let gate = CrisisGate::new(CrisisDetector::new(Arc::clone(&policy)));
        Self::with_gate(policy, gate)
    }
}

impl<S: SecondaryClassifier> MessageProcessor<S> {
    pub fn with_gate(policy: Arc<CompiledPolicy>, gate: CrisisGate<S>) -> Self {
        Self {
            policy,
            gate,
            audit: Arc::new(TracingAuditSink),
            lang: "en".to_string(),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Language for crisis messages ("en", "fr", "he").
    pub fn with_language(mut self, lang: &str) -> Self {
        self.lang = lang.to_string();
        self
    }

    pub fn policy(&self) -> &Arc<CompiledPolicy> {
        &self.policy
    }

    pub async fn process_user_input(
        &self,
        conversation_id: Option<&str>,
        text: &str,
        turn_index: u64,
    ) -> UserTurn {
        let message = Message::new(MessageRole::User, text, turn_index)
            .with_client_turn_id(Uuid::new_v4())
            .with_created_at(Utc::now());

        let classification = self.gate.classify(text).await;
        self.audit(conversation_id, &message, Some(classification.clone()));

        match crisis_response(&classification, &self.lang) {
            Some(response) => UserTurn::Crisis {
                message,
                classification,
                response,
            },
            None => UserTurn::Forward {
                message,
                classification,
            },
        }
    }

    pub fn process_assistant_reply(
        &self,
        conversation_id: Option<&str>,
        raw: &str,
        turn_index: u64,
        stats: &StabilityStats,
    ) -> AssistantTurn {
        let extraction = extract_display_text(raw, &self.policy, stats);

        let mut message = Message::new(MessageRole::Assistant, raw, turn_index).with_created_at(Utc::now());
        message.display_content = extraction.display_text;

        let (reply_metadata, offer_save) = match &extraction.structured_data {
            Some(data) => (
                Some(ReplyMetadata::from_structured(data)),
                should_offer_save(data, self.policy.save_offer()),
            ),
            None => (None, false),
        };
        message.metadata = extraction.structured_data;

        self.audit(conversation_id, &message, None);

        AssistantTurn {
            message,
            reply_metadata,
            offer_save,
        }
    }

    fn audit(
        &self,
        conversation_id: Option<&str>,
        message: &Message,
        classification: Option<CrisisClassification>,
    ) {
        let mut entry = AuditEntry::new(message.role, message.raw_content.clone());
        if let Some(id) = conversation_id {
            entry = entry.with_conversation(id);
        }
        if let Some(c) = classification {
            entry = entry.with_classification(c);
        }
        self.audit.record(entry);
    }
}
