//! Input hygiene and bypass normalization for crisis detection.
//!
//! Produces the text variants the crisis rules run against. The raw pass is
//! always checked; normalized and leet passes are additional, never a
//! replacement, because normalization can itself manufacture matches.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use super::policy::CompiledPolicy;
use super::types::DetectionPass;

/// Single letters or digits separated by punctuation or spacing: `k.i.l.l`, `k i l l`.
static SPACED_LETTERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:[\p{L}\p{N}][\s.\-_*·•|/\\]+){2,}[\p{L}\p{N}]\b").expect("valid regex")
});

static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s.\-_*·•|/\\]+").expect("valid regex"));

/// Remove zero-width and invisible Unicode characters plus control characters
/// (newline and tab survive), and fold typographic apostrophes to `'`.
pub fn clean_input(text: &str) -> String {
    text.chars()
        .filter(|c| {
            !matches!(
                *c,
                '\u{200B}'..='\u{200F}'  // Zero-width chars
                | '\u{202A}'..='\u{202E}' // Directional formatting
                | '\u{2060}'..='\u{2064}' // Invisible operators
                | '\u{2066}'..='\u{2069}' // Directional isolates
                | '\u{FEFF}'              // BOM
                | '\u{00AD}'              // Soft hyphen
                | '\u{034F}'              // Combining grapheme joiner
                | '\u{061C}'              // Arabic letter mark
                | '\u{180E}'              // Mongolian vowel separator
            )
        })
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{02BC}' => '\'',
            other => other,
        })
        .collect()
}

/// Map look-alike characters back to their Latin equivalents.
pub fn fold_homoglyphs(text: &str, map: &HashMap<char, char>) -> String {
    text.chars().map(|c| *map.get(&c).unwrap_or(&c)).collect()
}

/// Join letters that were split apart to dodge matching: `k.i.l.l` -> `kill`.
pub fn collapse_spaced_letters(text: &str) -> String {
    SPACED_LETTERS
        .replace_all(text, |caps: &regex::Captures<'_>| SEPARATORS.replace_all(&caps[0], "").into_owned())
        .into_owned()
}

/// Reverse leetspeak substitutions (`3` -> `e`, `@` -> `a`, `1` -> `i`).
pub fn reverse_leet(text: &str, map: &HashMap<char, char>) -> String {
    fold_homoglyphs(text, map)
}

/// All text variants to check, in order, deduplicated.
///
/// Homoglyph folding runs before idiom masking (idioms are masked per pass
/// by the detector), so a Cyrillic-spelled idiom is still recognised as one.
pub fn detection_passes(text: &str, policy: &CompiledPolicy) -> Vec<(DetectionPass, String)> {
    let raw = clean_input(text).to_lowercase();
    let normalized = collapse_spaced_letters(&fold_homoglyphs(&raw, &policy.homoglyphs));
    let leet = collapse_spaced_letters(&reverse_leet(&normalized, &policy.leet));

    let mut passes = vec![(DetectionPass::Raw, raw)];
    for (pass, variant) in [(DetectionPass::Normalized, normalized), (DetectionPass::Leet, leet)] {
        if passes.iter().all(|(_, existing)| *existing != variant) {
            passes.push((pass, variant));
        }
    }
    passes
}
