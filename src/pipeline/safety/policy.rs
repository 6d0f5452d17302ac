//! Externally configurable safety policy.
//!
//! Every table the pipeline matches against (forbidden reasoning prefixes,
//! crisis rules, idiom exceptions, homoglyph/leet maps, schema markers) lives
//! here as data. The policy is loaded from JSON so the safety content can
//! change without touching detector, sanitizer, or merge control flow.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config;
use crate::models::CrisisReason;

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Cannot read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Policy JSON is invalid: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Pattern '{rule}' does not compile: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },

    #[error("Character map '{table}' has a non single-character entry: {entry:?}")]
    InvalidCharMap { table: &'static str, entry: String },

    #[error("Policy field '{0}' must not be empty")]
    Empty(&'static str),
}

// ═══════════════════════════════════════════════════════════
// Policy data
// ═══════════════════════════════════════════════════════════

/// One ordered crisis rule. Rules are evaluated in list order; first match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisisRule {
    pub id: String,
    pub reason: CrisisReason,
    /// Regex matched case-insensitively against lowercased text.
    pub pattern: String,
    pub confidence: f32,
}

/// Which structured fields jointly justify offering to save a reply.
///
/// Both an elevated emotion signal AND a non-empty action-item list are
/// required; a single field never triggers the offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveOfferPolicy {
    pub emotion_signal_fields: Vec<String>,
    pub action_item_fields: Vec<String>,
    /// Minimum rating (0-10 scale) that counts as elevated.
    pub min_emotion_intensity: f64,
}

impl Default for SaveOfferPolicy {
    fn default() -> Self {
        Self {
            emotion_signal_fields: strings(&["emotion_ratings", "anxiety_level", "distress_level"]),
            action_item_fields: strings(&["homework", "action_items"]),
            min_emotion_intensity: 7.0,
        }
    }
}

/// The complete, serializable policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyPolicy {
    /// Line prefixes that mark internal reasoning (case-insensitive).
    pub forbidden_prefixes: Vec<String>,
    /// Code-fence info strings whose blocks are internal reasoning.
    pub internal_fence_tags: Vec<String>,
    pub crisis_rules: Vec<CrisisRule>,
    /// Figurative phrases masked out before crisis rules run.
    pub idiom_exceptions: Vec<String>,
    /// Look-alike character -> Latin character.
    pub homoglyphs: BTreeMap<String, String>,
    /// Leetspeak character -> letter.
    pub leet: BTreeMap<String, String>,
    /// JSON field names whose presence marks a structured reply.
    pub schema_markers: Vec<String>,
    /// Fields holding user-visible text, in priority order.
    pub display_fields: Vec<String>,
    /// Assistant message id prefixes used by "composing" placeholders.
    pub placeholder_id_prefixes: Vec<String>,
    /// Shown whenever sanitization leaves nothing user-visible.
    pub fallback_message: String,
    pub save_offer: SaveOfferPolicy,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            forbidden_prefixes: strings(&[
                "THOUGHT:",
                "THOUGHTS:",
                "THINKING:",
                "ANALYSIS:",
                "REASONING:",
                "PLAN:",
                "INTERNAL:",
                "DEBUG:",
                "[checking",
                "[internal",
                "my goal is",
                "let's break down",
                "let me break down",
                "the user is",
                "the user seems",
            ]),
            internal_fence_tags: strings(&[
                "think",
                "thinking",
                "thought",
                "reasoning",
                "internal",
                "analysis",
                "scratchpad",
            ]),
            crisis_rules: default_crisis_rules(),
            idiom_exceptions: strings(&[
                r"\bkill(?:s|ed|ing)?\s+(?:it|time|the\s+(?:game|vibe|mood)|two\s+birds)\b",
                r"\b(?:this|that|it|work|school|traffic)(?:\s+is|\s+was|'s)\s+(?:literally\s+|really\s+|just\s+)?killing\s+me\b",
                r"\b(?:you're|you\s+are|you)\s+killing\s+me\b",
                r"\bcould\s+(?:just\s+|literally\s+)?die\s+(?:of|from)\s+(?:laughter|laughing|embarrassment|shame|boredom|curiosity|cuteness|happiness|excitement)\b",
                r"\b(?:dying|die)\s+(?:of|from)\s+(?:laughter|embarrassment|boredom|curiosity|cuteness)\b",
                r"\bdying\s+(?:to|for)\b",
                r"\bto\s+die\s+for\b",
                r"\bdead\s+(?:tired|serious|wrong|on|set)\b",
                r"\bover\s+my\s+dead\s+body\b",
            ]),
            homoglyphs: char_map(&[
                ("а", "a"), ("е", "e"), ("ё", "e"), ("о", "o"), ("р", "p"),
                ("с", "c"), ("у", "y"), ("х", "x"), ("і", "i"), ("ї", "i"),
                ("ј", "j"), ("ѕ", "s"), ("к", "k"), ("м", "m"), ("т", "t"),
                ("н", "h"), ("ԁ", "d"), ("ӏ", "l"), ("һ", "h"), ("ԝ", "w"),
                ("α", "a"), ("ο", "o"), ("ι", "i"), ("κ", "k"), ("ν", "v"),
                ("ρ", "p"), ("τ", "t"), ("υ", "u"), ("ε", "e"),
            ]),
            leet: char_map(&[
                ("3", "e"), ("@", "a"), ("1", "i"), ("0", "o"),
                ("4", "a"), ("5", "s"), ("$", "s"), ("7", "t"),
            ]),
            schema_markers: strings(&[
                "assistant_message",
                "tool_calls",
                "homework",
                "mode",
                "emotion_ratings",
            ]),
            display_fields: strings(&["assistant_message"]),
            placeholder_id_prefixes: strings(&["placeholder-", "typing-", "pending-assistant-"]),
            fallback_message: "I'm here with you. Could you tell me a little more about how you're feeling right now?"
                .to_string(),
            save_offer: SaveOfferPolicy::default(),
        }
    }
}

fn default_crisis_rules() -> Vec<CrisisRule> {
    let rule = |id: &str, reason: CrisisReason, pattern: &str, confidence: f32| CrisisRule {
        id: id.to_string(),
        reason,
        pattern: pattern.to_string(),
        confidence,
    };
    vec![
        // Suicide
        rule(
            "suicide.end_own_life",
            CrisisReason::Suicide,
            r"\b(?:kill(?:ing)?|end(?:ing)?|take|taking)\s+(?:myself|my\s+(?:own\s+)?life)\b",
            0.95,
        ),
        rule("suicide.explicit", CrisisReason::Suicide, r"\bsuicid(?:e|al)\b", 0.9),
        rule(
            "suicide.want_to_die",
            CrisisReason::Suicide,
            r"\b(?:want|wanna|going|plan(?:ning)?|ready)\s+to\s+die\b",
            0.9,
        ),
        rule(
            "suicide.wish_dead",
            CrisisReason::Suicide,
            r"\bi\s+(?:wish\s+i\s+(?:was|were)|want\s+to\s+be)\s+dead\b",
            0.9,
        ),
        rule(
            "suicide.better_off",
            CrisisReason::Suicide,
            r"\bbetter\s+off\s+(?:dead|without\s+me)\b",
            0.85,
        ),
        rule(
            "suicide.no_reason_to_live",
            CrisisReason::Suicide,
            r"\bno\s+reason\s+to\s+(?:live|go\s+on)\b",
            0.85,
        ),
        rule("suicide.he", CrisisReason::Suicide, r"להתאבד|לשים\s+קץ\s+לחיי", 0.9),
        // Self-harm
        rule(
            "self_harm.hurt_myself",
            CrisisReason::SelfHarm,
            r"\b(?:hurt(?:ing)?|harm(?:ing)?|cut(?:ting)?|burn(?:ing)?)\s+myself\b",
            0.9,
        ),
        rule("self_harm.explicit", CrisisReason::SelfHarm, r"\bself[\s-]?harm(?:ing)?\b", 0.85),
        rule("self_harm.he", CrisisReason::SelfHarm, r"לפגוע\s+בעצמי", 0.85),
        // Overdose
        rule("overdose.explicit", CrisisReason::Overdose, r"\boverdos(?:e|ing)\b", 0.9),
        rule(
            "overdose.all_pills",
            CrisisReason::Overdose,
            r"\b(?:take|taking|took|taken|swallow|swallowing|swallowed)\s+(?:all\s+(?:of\s+)?)?(?:my|the|these|those)\s+(?:pills|meds|medications?|tablets)\b",
            0.8,
        ),
        rule(
            "overdose.pills_taken",
            CrisisReason::Overdose,
            r"\b(?:pills|meds|medications?|tablets)\s+i(?:'ve|\s+have|\s+just)?\s+(?:took|taken|swallowed)\b",
            0.8,
        ),
        // Immediate danger
        rule(
            "danger.threatened",
            CrisisReason::ImmediateDanger,
            r"\b(?:someone|somebody|he|she|they|my\s+\w+)(?:'s|'re|\s+is|\s+are)\s+(?:going\s+to\s+|gonna\s+|trying\s+to\s+)?(?:hurt|kill|attack)(?:ing)?\s+me\b",
            0.85,
        ),
        rule("danger.not_safe", CrisisReason::ImmediateDanger, r"\bi(?:'m|\s+am)\s+not\s+safe\b", 0.8),
        rule(
            "danger.weapon",
            CrisisReason::ImmediateDanger,
            r"\b(?:gun|knife)\s+to\s+my\s+(?:head|throat)\b",
            0.9,
        ),
        // General crisis
        rule(
            "crisis.cannot_go_on",
            CrisisReason::GeneralCrisis,
            r"\bi\s+can(?:'t|not|\s+not)\s+go\s+on\b",
            0.7,
        ),
        rule(
            "crisis.give_up_on_life",
            CrisisReason::GeneralCrisis,
            r"\b(?:give|giving)\s+up\s+on\s+(?:life|living|everything)\b",
            0.7,
        ),
        rule(
            "crisis.nothing_to_live_for",
            CrisisReason::GeneralCrisis,
            r"\bnothing\s+(?:left\s+)?to\s+live\s+for\b",
            0.75,
        ),
    ]
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn char_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect()
}

/// Where the active policy came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource {
    Env(PathBuf),
    DataDir(PathBuf),
    BuiltIn,
}

impl SafetyPolicy {
    /// Load a policy file. Missing fields keep their built-in defaults.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Resolve the active policy: env var path, then the data-dir file, then built-in.
    ///
    /// An explicitly configured file that fails to load is an error, never a
    /// silent fallback to defaults.
    pub fn resolve() -> Result<(Self, PolicySource), PolicyError> {
        if let Some(path) = std::env::var_os(config::POLICY_ENV_VAR).map(PathBuf::from) {
            let policy = Self::load(&path)?;
            tracing::info!(path = %path.display(), "Safety policy loaded from environment");
            return Ok((policy, PolicySource::Env(path)));
        }
        if let Some(path) = config::policy_path().filter(|p| p.is_file()) {
            let policy = Self::load(&path)?;
            tracing::info!(path = %path.display(), "Safety policy loaded from data directory");
            return Ok((policy, PolicySource::DataDir(path)));
        }
        tracing::debug!("Using built-in safety policy");
        Ok((Self::default(), PolicySource::BuiltIn))
    }
}

// ═══════════════════════════════════════════════════════════
// Compiled form
// ═══════════════════════════════════════════════════════════

/// A crisis rule with its regex compiled.
#[derive(Debug)]
pub struct CompiledRule {
    pub id: String,
    pub reason: CrisisReason,
    pub regex: Regex,
    pub confidence: f32,
}

/// Policy with every pattern compiled and every table validated.
/// Shared read-only across components via `Arc`.
#[derive(Debug)]
pub struct CompiledPolicy {
    pub source: SafetyPolicy,
    pub rules: Vec<CompiledRule>,
    pub idioms: Vec<Regex>,
    pub homoglyphs: HashMap<char, char>,
    pub leet: HashMap<char, char>,
    /// Lowercased forbidden prefixes.
    pub forbidden_prefixes: Vec<String>,
    /// Lowercased fence tags.
    pub internal_fence_tags: Vec<String>,
    /// Any schema marker in key position (`"assistant_message":`).
    /// `None` when the policy lists no markers.
    pub marker_keys: Option<Regex>,
    /// Per display field: lenient `"field": "..."` extractor.
    pub field_extractors: Vec<(String, Regex)>,
}

static BUILTIN: LazyLock<Arc<CompiledPolicy>> = LazyLock::new(|| {
    Arc::new(CompiledPolicy::compile(SafetyPolicy::default()).expect("built-in safety policy compiles"))
});

impl CompiledPolicy {
    pub fn compile(policy: SafetyPolicy) -> Result<Self, PolicyError> {
        if policy.fallback_message.trim().is_empty() {
            return Err(PolicyError::Empty("fallback_message"));
        }
        if policy.display_fields.is_empty() {
            return Err(PolicyError::Empty("display_fields"));
        }

        let rules = policy
            .crisis_rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    id: rule.id.clone(),
                    reason: rule.reason,
                    regex: case_insensitive(&rule.pattern, &rule.id)?,
                    confidence: rule.confidence.clamp(0.0, 1.0),
                })
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;

        let idioms = policy
            .idiom_exceptions
            .iter()
            .enumerate()
            .map(|(i, pattern)| case_insensitive(pattern, &format!("idiom_exceptions[{i}]")))
            .collect::<Result<Vec<_>, PolicyError>>()?;

        let field_extractors = policy
            .display_fields
            .iter()
            .map(|field| {
                let pattern = format!(r#"(?s)"{}"\s*:\s*"((?:[^"\\]|\\.)*)(?:"|\z)"#, regex::escape(field));
                let regex = Regex::new(&pattern).map_err(|source| PolicyError::InvalidPattern {
                    rule: format!("display_fields.{field}"),
                    source,
                })?;
                Ok((field.clone(), regex))
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;

        let marker_keys = if policy.schema_markers.is_empty() {
            None
        } else {
            let alternation = policy
                .schema_markers
                .iter()
                .map(|m| regex::escape(m))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = format!(r#""(?:{alternation})"\s*:"#);
            Some(Regex::new(&pattern).map_err(|source| PolicyError::InvalidPattern {
                rule: "schema_markers".to_string(),
                source,
            })?)
        };

        Ok(Self {
            homoglyphs: compile_char_map("homoglyphs", &policy.homoglyphs)?,
            leet: compile_char_map("leet", &policy.leet)?,
            forbidden_prefixes: policy.forbidden_prefixes.iter().map(|p| p.to_lowercase()).collect(),
            internal_fence_tags: policy.internal_fence_tags.iter().map(|t| t.to_lowercase()).collect(),
            marker_keys,
            rules,
            idioms,
            field_extractors,
            source: policy,
        })
    }

    /// The built-in policy, compiled once per process.
    pub fn builtin() -> Arc<CompiledPolicy> {
        Arc::clone(&BUILTIN)
    }

    pub fn fallback_message(&self) -> &str {
        &self.source.fallback_message
    }

    pub fn display_fields(&self) -> &[String] {
        &self.source.display_fields
    }

    pub fn save_offer(&self) -> &SaveOfferPolicy {
        &self.source.save_offer
    }

    /// True when an assistant message id marks a composing placeholder.
    pub fn is_placeholder_id(&self, id: &str) -> bool {
        self.source
            .placeholder_id_prefixes
            .iter()
            .any(|prefix| id.starts_with(prefix.as_str()))
    }
}

fn case_insensitive(pattern: &str, rule: &str) -> Result<Regex, PolicyError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| PolicyError::InvalidPattern {
            rule: rule.to_string(),
            source,
        })
}

fn compile_char_map(
    table: &'static str,
    map: &BTreeMap<String, String>,
) -> Result<HashMap<char, char>, PolicyError> {
    map.iter()
        .map(|(from, to)| match (single_char(from), single_char(to)) {
            (Some(f), Some(t)) => Ok((f, t)),
            _ => Err(PolicyError::InvalidCharMap {
                table,
                entry: format!("{from} -> {to}"),
            }),
        })
        .collect()
}

fn single_char(s: &str) -> Option<char> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_policy_compiles() {
        let compiled = CompiledPolicy::compile(SafetyPolicy::default()).unwrap();
        assert_eq!(compiled.rules.len(), SafetyPolicy::default().crisis_rules.len());
        assert_eq!(compiled.homoglyphs.get(&'а'), Some(&'a'));
        assert_eq!(compiled.leet.get(&'3'), Some(&'e'));
        let markers = compiled.marker_keys.as_ref().unwrap();
        assert!(markers.is_match(r#"{"assistant_message" : "hi"}"#));
        assert!(!markers.is_match(r#"{"label": "mode"}"#));
    }

    #[test]
    fn no_schema_markers_means_no_marker_keys() {
        let policy = SafetyPolicy {
            schema_markers: Vec::new(),
            ..SafetyPolicy::default()
        };
        assert!(CompiledPolicy::compile(policy).unwrap().marker_keys.is_none());
    }

    #[test]
    fn rules_keep_declared_order() {
        let compiled = CompiledPolicy::builtin();
        assert_eq!(compiled.rules[0].reason, CrisisReason::Suicide);
        assert_eq!(compiled.rules.last().unwrap().reason, CrisisReason::GeneralCrisis);
    }

    #[test]
    fn invalid_pattern_names_rule() {
        let mut policy = SafetyPolicy::default();
        policy.crisis_rules.push(CrisisRule {
            id: "broken".into(),
            reason: CrisisReason::GeneralCrisis,
            pattern: "(unclosed".into(),
            confidence: 0.5,
        });
        match CompiledPolicy::compile(policy) {
            Err(PolicyError::InvalidPattern { rule, .. }) => assert_eq!(rule, "broken"),
            other => panic!("expected InvalidPattern, got {other:?}"),
        }
    }

    #[test]
    fn multi_char_map_entry_rejected() {
        let mut policy = SafetyPolicy::default();
        policy.leet.insert("ph".into(), "f".into());
        assert!(matches!(
            CompiledPolicy::compile(policy),
            Err(PolicyError::InvalidCharMap { table: "leet", .. })
        ));
    }

    #[test]
    fn empty_fallback_rejected() {
        let policy = SafetyPolicy {
            fallback_message: "   ".into(),
            ..SafetyPolicy::default()
        };
        assert!(matches!(
            CompiledPolicy::compile(policy),
            Err(PolicyError::Empty("fallback_message"))
        ));
    }

    #[test]
    fn confidence_is_clamped() {
        let mut policy = SafetyPolicy::default();
        policy.crisis_rules[0].confidence = 4.0;
        let compiled = CompiledPolicy::compile(policy).unwrap();
        assert_eq!(compiled.rules[0].confidence, 1.0);
    }

    #[test]
    fn load_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"fallback_message": "Tell me more.", "schema_markers": ["reply"]}}"#
        )
        .unwrap();
        let policy = SafetyPolicy::load(file.path()).unwrap();
        assert_eq!(policy.fallback_message, "Tell me more.");
        assert_eq!(policy.schema_markers, vec!["reply".to_string()]);
        assert_eq!(policy.crisis_rules, SafetyPolicy::default().crisis_rules);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SafetyPolicy::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, PolicyError::Io { .. }));
    }

    #[test]
    fn load_malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            SafetyPolicy::load(file.path()),
            Err(PolicyError::Parse(_))
        ));
    }

    #[test]
    fn policy_round_trips_through_json() {
        let policy = SafetyPolicy::default();
        let json = serde_json::to_string_pretty(&policy).unwrap();
        let back: SafetyPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }

    #[test]
    fn placeholder_prefixes() {
        let compiled = CompiledPolicy::builtin();
        assert!(compiled.is_placeholder_id("placeholder-42"));
        assert!(compiled.is_placeholder_id("typing-abc"));
        assert!(!compiled.is_placeholder_id("msg-1"));
    }

    #[test]
    fn field_extractor_handles_escapes() {
        let compiled = CompiledPolicy::builtin();
        let (_, re) = &compiled.field_extractors[0];
        let caps = re
            .captures(r#"{"assistant_message": "Say \"hi\" please", "mode": "cbt"}"#)
            .unwrap();
        assert_eq!(&caps[1], r#"Say \"hi\" please"#);
    }
}
