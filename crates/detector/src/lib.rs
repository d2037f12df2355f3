//! Regex-driven PII and secret scanner producing pseudonym tokens.
//!
//! `scan` finds matches in pattern priority order; `anonymize` rewrites the
//! text with `[PREFIX_N]` tokens (PII) or partial masks (secrets) and
//! returns the token → original mapping for the vault. Secrets never enter
//! the mapping, so they cannot round-trip back out.

pub mod evasion;
pub mod luhn;
pub mod patterns;

use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use patterns::{Category, INDEXED_CATEGORIES, PatternDef, compile_patterns};

/// How far around a match cue words are searched for, in bytes.
const CUE_WINDOW: usize = 40;

/// Detection sensitivity; maps to the minimum confidence a pattern needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sensitivity {
    Low,
    #[default]
    Medium,
    High,
}

impl Sensitivity {
    pub fn threshold(&self) -> u8 {
        match self {
            Self::Low => 80,
            Self::Medium => 50,
            Self::High => 30,
        }
    }
}

impl FromStr for Sensitivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("unknown sensitivity: {s}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DetectorConfig {
    pub sensitivity: Sensitivity,
    /// Originals never reported.
    pub allow_list: Vec<String>,
    /// Originals always reported, bypassing confidence and Luhn.
    pub block_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PiiMatch {
    pub original: String,
    pub token: String,
    pub category: String,
    pub start: usize,
    pub end: usize,
    pub confidence: u8,
    pub secret: bool,
}

#[derive(Debug, Clone)]
pub struct Anonymized {
    pub text: String,
    /// Token → original, PII only.
    pub mapping: HashMap<String, String>,
    pub matches: Vec<PiiMatch>,
}

struct Counters([AtomicU64; INDEXED_CATEGORIES]);

impl Counters {
    fn new() -> Self {
        Self(std::array::from_fn(|_| AtomicU64::new(0)))
    }

    fn next(&self, index: usize) -> u64 {
        self.0[index].fetch_add(1, Ordering::Relaxed) + 1
    }

    fn reset(&self) {
        for counter in &self.0 {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

pub struct Detector {
    patterns: Vec<PatternDef>,
    config: DetectorConfig,
    counters: Counters,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            patterns: compile_patterns(),
            config,
            counters: Counters::new(),
        }
    }

    /// Reset the pseudonym counters. Test hook.
    pub fn reset_counters(&self) {
        self.counters.reset();
    }

    /// Scan a text for PII and secrets. Matches come out in pattern
    /// priority order; identical originals share one token.
    pub fn scan(&self, text: &str) -> Vec<PiiMatch> {
        let threshold = self.config.sensitivity.threshold();
        let mut matches = Vec::new();
        let mut issued: HashMap<String, String> = HashMap::new();

        for def in &self.patterns {
            for m in def.regex.find_iter(text) {
                let original = m.as_str();

                if self.config.allow_list.iter().any(|a| a == original) {
                    continue;
                }
                let block_listed = self.config.block_list.iter().any(|b| b == original);
                if !block_listed {
                    if def.confidence < threshold {
                        continue;
                    }
                    if def.category == Category::Card && !luhn::luhn_check(original) {
                        continue;
                    }
                    if !def.cues.is_empty() && !has_cue(text, m.start(), m.end(), def.cues) {
                        continue;
                    }
                }

                let token = issued
                    .entry(original.to_string())
                    .or_insert_with(|| self.issue_token(def.category, original))
                    .clone();

                matches.push(PiiMatch {
                    original: original.to_string(),
                    token,
                    category: if def.category.is_secret() {
                        def.label.to_string()
                    } else {
                        def.category.prefix().to_string()
                    },
                    start: m.start(),
                    end: m.end(),
                    confidence: def.confidence,
                    secret: def.category.is_secret(),
                });
            }
        }

        matches
    }

    /// Rewrite `text` with pseudonym tokens and return the vault mapping.
    pub fn anonymize(&self, text: &str) -> Anonymized {
        let matches = self.scan(text);

        // Overlapping hits keep the earlier (higher-priority) pattern.
        let mut accepted: Vec<PiiMatch> = Vec::new();
        for m in matches {
            let overlaps = accepted
                .iter()
                .any(|a| m.start < a.end && a.start < m.end);
            if !overlaps {
                accepted.push(m);
            }
        }

        // Substitute from the end so byte offsets stay valid.
        accepted.sort_by(|a, b| b.start.cmp(&a.start));
        let mut out = text.to_string();
        for m in &accepted {
            out.replace_range(m.start..m.end, &m.token);
        }

        let mapping = accepted
            .iter()
            .filter(|m| !m.secret)
            .map(|m| (m.token.clone(), m.original.clone()))
            .collect();

        Anonymized {
            text: out,
            mapping,
            matches: accepted,
        }
    }

    fn issue_token(&self, category: Category, original: &str) -> String {
        match category.index() {
            Some(index) => format!("[{}_{}]", category.prefix(), self.counters.next(index)),
            // Secrets get a partial mask; the original is never stored.
            None => partial_mask(original),
        }
    }
}

fn has_cue(text: &str, start: usize, end: usize, cues: &[&str]) -> bool {
    let lo = floor_char_boundary(text, start.saturating_sub(CUE_WINDOW));
    let hi = ceil_char_boundary(text, (end + CUE_WINDOW).min(text.len()));
    let window = text[lo..hi].to_lowercase();
    cues.iter().any(|cue| window.contains(cue))
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

/// Secret mask: leading 40% of characters preserved, remainder `*`.
pub fn partial_mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let keep = (chars.len() * 2).div_ceil(5);
    let mut out: String = chars[..keep].iter().collect();
    out.extend(std::iter::repeat_n('*', chars.len() - keep));
    out
}

/// Viewer mask: ~30% of characters preserved, split between front and back,
/// the middle overwritten with `x`. Character length is preserved.
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let n = chars.len();
    if n <= 2 {
        return "x".repeat(n);
    }

    let visible = (n * 3 / 10).max(2);
    let front = visible / 2;
    let back = visible - front;

    let mut out: String = chars[..front].iter().collect();
    out.extend(std::iter::repeat_n('x', n - visible));
    out.extend(chars[n - back..].iter());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> Detector {
        Detector::default()
    }

    #[test]
    fn test_cccd_anonymized() {
        let d = detector();
        let result = d.anonymize("CCCD của tôi là 012345678901");

        assert!(!result.text.contains("012345678901"));
        assert!(result.text.contains("[CCCD_1]"));
        assert_eq!(result.mapping.len(), 1);
        assert_eq!(result.mapping["[CCCD_1]"], "012345678901");
    }

    #[test]
    fn test_dedup_identical_originals() {
        let d = detector();
        let result = d.anonymize("mail a@b.com again a@b.com");

        assert_eq!(result.mapping.len(), 1);
        assert_eq!(result.matches.len(), 2);
        assert_eq!(result.matches[0].token, result.matches[1].token);
        assert!(!result.text.contains("a@b.com"));
    }

    #[test]
    fn test_distinct_originals_distinct_tokens() {
        let d = detector();
        let result = d.anonymize("from a@b.com to c@d.com");

        assert_eq!(result.mapping.len(), 2);
        let tokens: Vec<&String> = result.mapping.keys().collect();
        assert_ne!(tokens[0], tokens[1]);
    }

    #[test]
    fn test_no_original_survives_anonymize() {
        let d = detector();
        let text = "email a@b.com, CCCD 012345678901, phone 0912345678";
        let result = d.anonymize(text);

        for original in result.mapping.values() {
            assert!(!result.text.contains(original.as_str()), "{original} leaked");
        }
    }

    #[test]
    fn test_secret_masked_and_not_mapped() {
        let d = detector();
        let secret = "sk-ant-REDACTED";
        let result = d.anonymize(&format!("my key is {secret}"));

        assert!(!result.text.contains(secret));
        assert!(result.mapping.is_empty());

        let mask = partial_mask(secret);
        assert!(result.text.contains(&mask));
        // Leading 40% kept, so the provider prefix is recognizable.
        assert!(mask.starts_with("sk-ant-"));
        assert!(mask.ends_with('*'));
    }

    #[test]
    fn test_anthropic_key_wins_over_generic_sk() {
        let d = detector();
        let result = d.scan("sk-ant-REDACTED");

        let secret_matches: Vec<_> = result.iter().filter(|m| m.secret).collect();
        assert_eq!(secret_matches[0].category, "anthropic_api_key");
    }

    #[test]
    fn test_card_requires_luhn() {
        let d = detector();
        assert!(
            d.scan("pay 4242 4242 4242 4242 now")
                .iter()
                .any(|m| m.category == "CARD")
        );
        assert!(
            !d.scan("pay 4242 4242 4242 4243 now")
                .iter()
                .any(|m| m.category == "CARD")
        );
    }

    #[test]
    fn test_block_list_bypasses_luhn() {
        let d = Detector::new(DetectorConfig {
            block_list: vec!["1111 2222 3333 4444".into()],
            ..Default::default()
        });
        assert!(
            d.scan("card 1111 2222 3333 4444")
                .iter()
                .any(|m| m.category == "CARD")
        );
    }

    #[test]
    fn test_allow_list_suppresses() {
        let d = Detector::new(DetectorConfig {
            allow_list: vec!["noreply@example.com".into()],
            ..Default::default()
        });
        assert!(d.scan("contact noreply@example.com").is_empty());
    }

    #[test]
    fn test_bank_needs_cue() {
        let d = detector();
        assert!(d.scan("order id 123456789012345").is_empty());
        assert!(
            d.scan("số tài khoản 123456789012345")
                .iter()
                .any(|m| m.category == "BANK")
        );
    }

    #[test]
    fn test_low_sensitivity_drops_weak_patterns() {
        let d = Detector::new(DetectorConfig {
            sensitivity: Sensitivity::Low,
            ..Default::default()
        });
        // CMND confidence 60 < 80.
        assert!(d.scan("so CMND 123456785").is_empty());
        // Email confidence 95 still passes.
        assert!(!d.scan("mail a@b.com").is_empty());
    }

    #[test]
    fn test_counters_are_monotonic_and_resettable() {
        let d = detector();
        let first = d.anonymize("a@b.com");
        let second = d.anonymize("c@d.com");
        assert!(first.text.contains("[EMAIL_1]"));
        assert!(second.text.contains("[EMAIL_2]"));

        d.reset_counters();
        let third = d.anonymize("e@f.com");
        assert!(third.text.contains("[EMAIL_1]"));
    }

    #[test]
    fn test_partial_mask_keeps_leading_40_percent() {
        let mask = partial_mask("abcdefghij");
        assert_eq!(mask, "abcd******");
        assert_eq!(mask.chars().count(), 10);
    }

    #[test]
    fn test_viewer_mask_preserves_length() {
        for value in ["012345678901", "a@b.com", "0912345678", "xy"] {
            let masked = mask_value(value);
            assert_eq!(masked.chars().count(), value.chars().count());
        }
        let masked = mask_value("012345678901");
        assert!(masked.contains("xx"));
        assert_ne!(masked, "012345678901");
    }

    #[test]
    fn test_malformed_input_yields_no_matches() {
        let d = detector();
        assert!(d.scan("").is_empty());
        assert!(d.scan("\u{FFFD}\u{0000}±±±").is_empty());
    }

    #[test]
    fn test_clean_vietnamese_text_passes() {
        let d = detector();
        assert!(d.scan("Xin chào, tôi muốn hỏi về sản phẩm").is_empty());
    }
}
