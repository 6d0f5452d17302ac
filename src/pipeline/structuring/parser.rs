use serde_json::{Map, Value};

use super::types::{AssistantOutput, DisplayExtraction, StructuredReply};
use crate::pipeline::safety::output_sanitize::sanitize_llm_output;
use crate::pipeline::safety::policy::CompiledPolicy;
use crate::pipeline::stability::{Counter, StabilityStats};

/// Turn a raw assistant reply into render-safe display text plus optional
/// structured side-channel data. Never fails and never returns raw JSON as
/// display text for schema-bearing replies.
pub fn extract_display_text(
    raw: &str,
    policy: &CompiledPolicy,
    stats: &StabilityStats,
) -> DisplayExtraction {
    match classify_output(raw, policy, stats) {
        AssistantOutput::PlainText(text) => DisplayExtraction {
            display_text: sanitize_llm_output(&text, policy),
            structured_data: None,
        },
        AssistantOutput::Structured(reply) => DisplayExtraction {
            display_text: sanitize_llm_output(&reply.message, policy),
            structured_data: (!reply.recovered).then_some(reply.data),
        },
        AssistantOutput::Unparseable => DisplayExtraction {
            display_text: policy.fallback_message().to_string(),
            structured_data: None,
        },
    }
}

/// Decide what kind of reply this is. Parsing is only attempted after the
/// cheap pre-check passes.
pub fn classify_output(
    raw: &str,
    policy: &CompiledPolicy,
    stats: &StabilityStats,
) -> AssistantOutput {
    let Some(candidate) = json_candidate(raw, policy) else {
        stats.record(Counter::ParseSkippedNonJson);
        return AssistantOutput::PlainText(raw.to_string());
    };

    stats.record(Counter::ParseAttempts);

    if let Some(reply) = parse_strict(candidate, policy) {
        return AssistantOutput::Structured(reply);
    }

    if let Some(reply) = extract_robust(raw, policy) {
        tracing::debug!(
            field = %reply.display_field,
            raw_len = raw.len(),
            "Recovered display field from malformed structured reply"
        );
        return AssistantOutput::Structured(reply);
    }

    stats.record(Counter::ParseFailed);
    tracing::warn!(raw_len = raw.len(), "Structured reply had no recoverable display field");
    AssistantOutput::Unparseable
}

// ═══════════════════════════════════════════════════════════
// Pre-check
// ═══════════════════════════════════════════════════════════

/// The JSON body to parse, or `None` for prose.
///
/// Accepts text that starts (after whitespace) with `{` or `[`, or with a code
/// fence whose first content is `{` or `[`. In both cases at least one quoted
/// schema marker must be present.
fn json_candidate<'a>(raw: &'a str, policy: &CompiledPolicy) -> Option<&'a str> {
    let trimmed = raw.trim_start();

    let body = if let Some(after_fence) = trimmed.strip_prefix("```") {
        let newline = after_fence.find('\n')?;
        let info = after_fence[..newline].trim();
        if !(info.is_empty() || info.eq_ignore_ascii_case("json")) {
            return None;
        }
        let inner = after_fence[newline + 1..].trim_start();
        match inner.rfind("```") {
            Some(close) => inner[..close].trim_end(),
            None => inner.trim_end(),
        }
    } else {
        trimmed
    };

    if !(body.starts_with('{') || body.starts_with('[')) {
        return None;
    }
    if !policy.marker_keys.as_ref().is_some_and(|re| re.is_match(body)) {
        return None;
    }
    Some(body)
}

// ═══════════════════════════════════════════════════════════
// Strict parse
// ═══════════════════════════════════════════════════════════

fn parse_strict(candidate: &str, policy: &CompiledPolicy) -> Option<StructuredReply> {
    let value = match serde_json::from_str::<Value>(candidate) {
        Ok(v) => v,
        // Valid JSON followed by trailing prose: take the first value.
        Err(_) => serde_json::Deserializer::from_str(candidate)
            .into_iter::<Value>()
            .next()?
            .ok()?,
    };

    match value {
        Value::Object(obj) => split_display_field(obj, policy),
        Value::Array(items) => items.into_iter().find_map(|item| match item {
            Value::Object(obj) => split_display_field(obj, policy),
            _ => None,
        }),
        _ => None,
    }
}

fn split_display_field(mut obj: Map<String, Value>, policy: &CompiledPolicy) -> Option<StructuredReply> {
    let field = policy
        .display_fields()
        .iter()
        .find(|f| obj.get(f.as_str()).is_some_and(Value::is_string))?
        .clone();
    let message = match obj.remove(&field) {
        Some(Value::String(s)) => s,
        _ => return None,
    };
    Some(StructuredReply {
        display_field: field,
        message,
        data: Value::Object(obj),
        recovered: false,
    })
}

// ═══════════════════════════════════════════════════════════
// Robust extractor
// ═══════════════════════════════════════════════════════════

/// Pull the display field out of text that is not valid JSON: truncated
/// streams, unbalanced braces, fenced blocks with trailing commentary.
fn extract_robust(raw: &str, policy: &CompiledPolicy) -> Option<StructuredReply> {
    policy.field_extractors.iter().find_map(|(field, re)| {
        let caps = re.captures(raw)?;
        let escaped = caps.get(1)?.as_str();
        Some(StructuredReply {
            display_field: field.clone(),
            message: unescape_json_string(escaped),
            data: Value::Null,
            recovered: true,
        })
    })
}

/// Decode JSON string escapes. Falls back to a manual pass when the fragment
/// is cut off mid-escape.
fn unescape_json_string(escaped: &str) -> String {
    if let Ok(s) = serde_json::from_str::<String>(&format!("\"{escaped}\"")) {
        return s;
    }

    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') | Some('f') => {}
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                if hex.len() == 4 {
                    if let Some(ch) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                        out.push(ch);
                    }
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
