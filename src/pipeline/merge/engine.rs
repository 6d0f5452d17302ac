use std::collections::HashSet;
use std::sync::Arc;

use crate::models::{DedupKey, Message, MessageRole};
use crate::pipeline::safety::policy::CompiledPolicy;
use crate::pipeline::stability::{Counter, StabilityStats};
use crate::pipeline::structuring::extract_display_text;

/// Result of one merge call.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The new ordered, deduplicated, render-safe sequence.
    pub messages: Vec<Message>,
    /// Keys of incoming messages held back by the render-safety gate.
    pub rejected: Vec<DedupKey>,
    /// True when something was rejected and a refetch should replace it.
    pub refetch_required: bool,
}

/// Combines deliveries from every source into one conversation sequence.
///
/// Not reentrant: callers serialize merges (see `ConversationSession`).
#[derive(Debug, Clone)]
pub struct MergeEngine {
    policy: Arc<CompiledPolicy>,
}

impl MergeEngine {
    pub fn new(policy: Arc<CompiledPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CompiledPolicy {
        &self.policy
    }

    pub fn merge(
        &self,
        current: &[Message],
        incoming: &[Message],
        stats: &StabilityStats,
    ) -> MergeOutcome {
        let mut messages: Vec<Message> = Vec::with_capacity(current.len() + incoming.len());
        for msg in current {
            if self.is_placeholder(msg) {
                stats.record(Counter::PlaceholderBecameMessage);
                tracing::warn!(key = %msg.dedup_key(), "Placeholder found in conversation state, removed");
                continue;
            }
            messages.push(msg.clone());
        }

        let mut rejected = Vec::new();

        for msg in incoming {
            if self.is_placeholder(msg) {
                stats.record(Counter::PlaceholderDropped);
                tracing::debug!(key = %msg.dedup_key(), "Composing placeholder dropped");
                continue;
            }

            let prepared = self.prepare(msg, stats);
            let slot = messages.iter().position(|existing| same_turn(existing, &prepared));

            if prepared.is_assistant() && !is_render_safe(&prepared.display_content) {
                stats.record(Counter::UnsafeSkipped);
                tracing::warn!(
                    key = %prepared.dedup_key(),
                    has_slot = slot.is_some(),
                    display_len = prepared.display_content.len(),
                    "Render-safety gate rejected message"
                );
                rejected.push(prepared.dedup_key());
                continue;
            }

            match slot {
                Some(i) => {
                    stats.record(Counter::DuplicateBlocked);
                    let existing = &mut messages[i];
                    let changed = absorb(existing, prepared);
                    tracing::debug!(key = %existing.dedup_key(), changed, "Redelivery merged into existing slot");
                }
                None => messages.push(prepared),
            }
        }

        // Stable: previously accepted messages keep their relative order.
        messages.sort_by(|a, b| (a.turn_index, a.created_at).cmp(&(b.turn_index, b.created_at)));

        self.post_check(&mut messages, stats);

        let refetch_required = !rejected.is_empty();
        MergeOutcome {
            messages,
            rejected,
            refetch_required,
        }
    }

    /// Composing placeholders are UI state, never conversation content.
    pub fn is_placeholder(&self, msg: &Message) -> bool {
        msg.role == MessageRole::Assistant
            && (msg.raw_content.trim().is_empty()
                || msg.id.as_deref().is_some_and(|id| self.policy.is_placeholder_id(id)))
    }

    /// Re-derive display text and metadata from the raw content. Whatever
    /// display text the source sent is not trusted.
    fn prepare(&self, msg: &Message, stats: &StabilityStats) -> Message {
        let mut prepared = msg.clone();
        if !msg.is_assistant() {
            prepared.display_content = msg.raw_content.clone();
            return prepared;
        }
        let extraction = extract_display_text(&msg.raw_content, &self.policy, stats);
        prepared.display_content = extraction.display_text;
        if extraction.structured_data.is_some() {
            prepared.metadata = extraction.structured_data;
        }
        prepared
    }

    /// Tripwire for the sequence invariants. Violations are counted and
    /// repaired (first occurrence wins).
    fn post_check(&self, messages: &mut Vec<Message>, stats: &StabilityStats) {
        let mut seen = HashSet::new();
        messages.retain(|m| {
            if self.is_placeholder(m) {
                stats.record(Counter::PlaceholderBecameMessage);
                return false;
            }
            if !seen.insert(m.dedup_key()) {
                stats.record(Counter::DuplicateOccurred);
                tracing::warn!(key = %m.dedup_key(), "Duplicate key in merged sequence, removed");
                return false;
            }
            true
        });
    }
}

/// Whether two deliveries are the same logical turn.
fn same_turn(a: &Message, b: &Message) -> bool {
    if a.role != b.role {
        return false;
    }
    let id = |m: &Message| m.id.clone().filter(|id| !id.trim().is_empty());
    match (id(a), id(b)) {
        (Some(x), Some(y)) => x == y,
        _ => match (a.client_turn_id, b.client_turn_id) {
            (Some(x), Some(y)) => x == y,
            _ => without_id(a).dedup_key() == without_id(b).dedup_key(),
        },
    }
}

fn without_id(m: &Message) -> Message {
    let mut copy = m.clone();
    copy.id = None;
    copy
}

/// Fold a redelivery into its slot. Position fields (`turn_index`,
/// `created_at`) stay put so the slot never moves. Returns whether the
/// visible content changed.
fn absorb(existing: &mut Message, incoming: Message) -> bool {
    if existing.id.is_none() {
        existing.id = incoming.id.clone();
    }
    if existing.client_turn_id.is_none() {
        existing.client_turn_id = incoming.client_turn_id;
    }
    if existing.raw_content == incoming.raw_content && existing.metadata == incoming.metadata {
        return false;
    }
    existing.raw_content = incoming.raw_content;
    existing.display_content = incoming.display_content;
    existing.metadata = incoming.metadata;
    true
}

/// Whether `messages` holds the turn identified by `key` with content that
/// passes the render-safety gate. Server copies of an id-less turn gain an
/// id, so the key is also compared with the id set aside.
pub fn holds_safe_turn(messages: &[Message], key: &DedupKey) -> bool {
    messages.iter().any(|m| {
        (m.dedup_key() == *key || without_id(m).dedup_key() == *key)
            && (!m.is_assistant() || is_render_safe(&m.display_content))
    })
}

/// Render-safety gate for assistant display text: no JSON-looking text, no
/// leading fence, no unbalanced braces.
pub fn is_render_safe(display: &str) -> bool {
    let trimmed = display.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.starts_with('{') || is_json_array(trimmed) {
        return false;
    }
    if trimmed.starts_with("```") {
        return false;
    }
    trimmed.matches('{').count() == trimmed.matches('}').count()
}

/// `[` opens prose too (`[sighs]`), so only an array of objects or strings,
/// or text that parses as JSON, counts.
fn is_json_array(text: &str) -> bool {
    let Some(rest) = text.strip_prefix('[') else {
        return false;
    };
    let rest = rest.trim_start();
    rest.starts_with('{') || rest.starts_with('"') || serde_json::from_str::<serde_json::Value>(text).is_ok()
}
