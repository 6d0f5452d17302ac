//! Post-LLM output sanitization.
//!
//! Removes internal reasoning from assistant text before display: whole
//! lines starting with a forbidden prefix (`THOUGHT:`, `PLAN:`, ...), fenced
//! blocks tagged as reasoning, `<think>` style tag blocks, and stray
//! `<unusedN>` model tokens. Lines are dropped, never redacted in place.
//!
//! Guarantees: the result is never empty, and `sanitize(sanitize(x)) ==
//! sanitize(x)`. Text with nothing to remove is returned byte-for-byte.

use std::sync::LazyLock;

use regex::Regex;

use super::policy::CompiledPolicy;

static UNUSED_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<unused\d+>").expect("valid regex"));

/// Strip reasoning leakage from assistant text.
pub fn sanitize_llm_output(raw: &str, policy: &CompiledPolicy) -> String {
    let mut text = match strip_pass(raw, policy) {
        None => raw.to_string(),
        Some(mut current) => {
            // Removing one block can expose another (a tag split around a
            // nested block), so repeat until a pass changes nothing. Every
            // changing pass shortens the text, so this terminates.
            while let Some(next) = strip_pass(&current, policy) {
                current = next;
            }
            current
        }
    };

    if text.trim().is_empty() {
        tracing::debug!(raw_len = raw.len(), "Sanitizer left no visible text; using fallback");
        text = policy.fallback_message().to_string();
    }
    text
}

/// One sanitization pass. `None` when nothing was removed.
fn strip_pass(text: &str, policy: &CompiledPolicy) -> Option<String> {
    let mut changed = false;

    let mut current = strip_tag_blocks(text, &policy.internal_fence_tags);
    changed |= current != text;

    if UNUSED_TOKEN_RE.is_match(&current) {
        current = UNUSED_TOKEN_RE.replace_all(&current, "").into_owned();
        changed = true;
    }

    let mut kept: Vec<&str> = Vec::new();
    let mut in_internal_fence = false;
    for line in current.split('\n') {
        let trimmed = line.trim();
        if in_internal_fence {
            changed = true;
            if trimmed.starts_with("```") {
                in_internal_fence = false;
            }
            continue;
        }
        if let Some(info) = trimmed.strip_prefix("```") {
            let tag = info.trim().to_lowercase();
            if policy.internal_fence_tags.iter().any(|t| *t == tag) {
                in_internal_fence = true;
                changed = true;
                continue;
            }
        }
        if is_forbidden_line(line, &policy.forbidden_prefixes) {
            changed = true;
            continue;
        }
        kept.push(line);
    }

    if !changed {
        return None;
    }
    Some(kept.join("\n").trim().to_string())
}

/// True if the line opens with a reasoning marker, ignoring markdown
/// decoration such as `**THOUGHT:**` or `> PLAN:`.
fn is_forbidden_line(line: &str, prefixes: &[String]) -> bool {
    let bare = line.trim_start().trim_start_matches(['*', '_', '#', '>', '-', ' ', '\t']);
    prefixes.iter().any(|prefix| {
        bare
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}

/// Remove `<tag>...</tag>` blocks for every reasoning tag. An unclosed
/// opening tag drops everything after it.
fn strip_tag_blocks(input: &str, tags: &[String]) -> String {
    let mut out = input.to_string();
    for tag in tags {
        let open = format!("<{tag}>");
        let close = format!("</{tag}>");
        while let Some(start) = find_ignore_ascii_case(&out, &open) {
            let after_open = start + open.len();
            let end = find_ignore_ascii_case(&out[after_open..], &close)
                .map(|rel| after_open + rel + close.len())
                .unwrap_or(out.len());
            out.replace_range(start..end, "");
        }
    }
    out
}

fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| {
            haystack
                .get(i..i + needle.len())
                .is_some_and(|window| window.eq_ignore_ascii_case(needle))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitize(text: &str) -> String {
        sanitize_llm_output(text, &CompiledPolicy::builtin())
    }

    fn fallback() -> String {
        CompiledPolicy::builtin().fallback_message().to_string()
    }

    // ── Literal scenario ───────────────────────────────────────

    #[test]
    fn strips_thought_and_plan_lines() {
        let raw = "THOUGHT: analyze user.\nPLAN: ask about mood.\n\nHow are you feeling today?";
        assert_eq!(sanitize(raw), "How are you feeling today?");
    }

    // ── Pass-through ───────────────────────────────────────────

    #[test]
    fn clean_text_unchanged_byte_for_byte() {
        let texts = [
            "How are you feeling today?",
            "  Leading spaces and trailing newline\n",
            "Line one\n\nLine two",
            "אני כאן בשבילך. איך עבר עלייך היום?",
            "I noticed you said \"always\". Let's look at that thought together.",
            "Plan your week with one small step.",
        ];
        for text in texts {
            assert_eq!(sanitize(text), text, "Changed clean text: {text:?}");
        }
    }

    // ── Prefix variants ────────────────────────────────────────

    #[test]
    fn every_forbidden_prefix_is_removed() {
        let prefixes = [
            "THOUGHT:", "THINKING:", "ANALYSIS:", "REASONING:", "PLAN:", "INTERNAL:",
            "DEBUG:", "[checking", "[internal", "My goal is", "Let's break down",
        ];
        for prefix in prefixes {
            let raw = format!("{prefix} something internal\nThat sounds hard.");
            assert_eq!(sanitize(&raw), "That sounds hard.", "Prefix not removed: {prefix}");
        }
    }

    #[test]
    fn prefix_match_is_case_insensitive_and_ignores_markdown() {
        let raw = "**Thought:** user is sad\n> plan: validate\n- Debug: x\nI'm sorry today was hard.";
        assert_eq!(sanitize(raw), "I'm sorry today was hard.");
    }

    #[test]
    fn prefix_in_middle_of_line_is_kept() {
        let raw = "Sometimes a THOUGHT: can feel very loud.";
        assert_eq!(sanitize(raw), raw);
    }

    // ── Blocks and tokens ──────────────────────────────────────

    #[test]
    fn strips_internal_fenced_block() {
        let raw = "```thinking\nuser seems anxious\nask about sleep\n```\nHow did you sleep last night?";
        assert_eq!(sanitize(raw), "How did you sleep last night?");
    }

    #[test]
    fn keeps_ordinary_fenced_block() {
        let raw = "Try this:\n```\nBreathe in 4, hold 4, out 4\n```";
        assert_eq!(sanitize(raw), raw);
    }

    #[test]
    fn unclosed_internal_fence_drops_rest() {
        let raw = "Thanks for sharing.\n```reasoning\nstep 1\nstep 2";
        assert_eq!(sanitize(raw), "Thanks for sharing.");
    }

    #[test]
    fn strips_think_tags() {
        let raw = "<think>The user wants reassurance.</think>You're doing better than you think.";
        assert_eq!(sanitize(raw), "You're doing better than you think.");
    }

    #[test]
    fn strips_nested_split_tags_to_fixpoint() {
        let raw = "<thi<think>x</think>nk>hidden</think>Visible.";
        let once = sanitize(raw);
        assert_eq!(once, "Visible.");
        assert_eq!(sanitize(&once), once);
    }

    #[test]
    fn strips_unused_tokens() {
        let raw = "Some text <unused12> and more<unused0>.";
        assert_eq!(sanitize(raw), "Some text  and more.");
    }

    // ── Fallback ───────────────────────────────────────────────

    #[test]
    fn empty_and_whitespace_become_fallback() {
        for raw in ["", "   ", "\n\n\t"] {
            assert_eq!(sanitize(raw), fallback());
        }
    }

    #[test]
    fn only_reasoning_becomes_fallback() {
        let raw = "THOUGHT: x\nPLAN: y";
        assert_eq!(sanitize(raw), fallback());
    }

    #[test]
    fn fallback_is_stable() {
        assert_eq!(sanitize(&fallback()), fallback());
    }

    // ── Properties ─────────────────────────────────────────────

    #[test]
    fn idempotent_over_mixed_inputs() {
        let inputs = [
            "THOUGHT: a\n\n  Hello  \n",
            "```internal\nx\n```\n\nPLAN: y\nHi there",
            "<think>a</think>\n\nDEBUG: b\n  ",
            "[checking mood]\n\nNice work on the exercise.",
            "",
            "plain",
        ];
        for input in inputs {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once, "Not idempotent for {input:?}");
            assert!(!once.trim().is_empty());
        }
    }

    #[test]
    fn prefix_only_reply_becomes_fallback() {
        let policy = CompiledPolicy::builtin();
        assert_eq!(
            sanitize_llm_output("PLAN: go for a run tomorrow", &policy),
            policy.fallback_message()
        );
    }
}
