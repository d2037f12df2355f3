//! Deobfuscation for the injection guard and the skill auditor.
//!
//! Produces candidate strings recovered from common evasion encodings.
//! Candidates never feed PII substitution, which must keep byte positions.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use regex::Regex;
use std::sync::LazyLock;

static BASE64_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/_-]{20,}={0,2}").unwrap());

static DOTTED_LETTERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:[A-Za-z][.\-_*]){3,}[A-Za-z]").unwrap());

static SPACED_LETTERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:[A-Za-z] ){3,}[A-Za-z]\b").unwrap());

const ZERO_WIDTH: &[char] = &[
    '\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}', '\u{2060}', '\u{00AD}',
];

// Cyrillic/Greek characters commonly swapped for their Latin lookalikes.
const HOMOGLYPHS: &[(char, char)] = &[
    ('а', 'a'),
    ('е', 'e'),
    ('о', 'o'),
    ('р', 'p'),
    ('с', 'c'),
    ('х', 'x'),
    ('у', 'y'),
    ('і', 'i'),
    ('ѕ', 's'),
    ('ј', 'j'),
    ('А', 'A'),
    ('В', 'B'),
    ('Е', 'E'),
    ('К', 'K'),
    ('М', 'M'),
    ('Н', 'H'),
    ('О', 'O'),
    ('Р', 'P'),
    ('С', 'C'),
    ('Т', 'T'),
    ('α', 'a'),
    ('ε', 'e'),
    ('ι', 'i'),
    ('ο', 'o'),
    ('υ', 'u'),
];

/// Candidate plaintexts hidden in a line: Base64 payloads, zero-width and
/// homoglyph normalizations, and split-letter sequences collapsed.
pub fn deobfuscate(line: &str) -> Vec<String> {
    let mut candidates = Vec::new();

    for run in BASE64_RUN.find_iter(line) {
        if let Some(decoded) = decode_base64(run.as_str()) {
            candidates.push(decoded);
        }
    }

    let normalized = normalize_unicode(line);
    if normalized != line {
        candidates.push(normalized);
    }

    if let Some(collapsed) = collapse_split_letters(line) {
        candidates.push(collapsed);
    }

    candidates
}

/// Strip zero-width marks and fold known homoglyphs to ASCII.
pub fn normalize_unicode(text: &str) -> String {
    text.chars()
        .filter(|c| !ZERO_WIDTH.contains(c))
        .map(|c| {
            HOMOGLYPHS
                .iter()
                .find(|(from, _)| *from == c)
                .map(|(_, to)| *to)
                .unwrap_or(c)
        })
        .collect()
}

fn decode_base64(run: &str) -> Option<String> {
    let bytes = STANDARD
        .decode(run)
        .or_else(|_| URL_SAFE.decode(run))
        .or_else(|_| URL_SAFE_NO_PAD.decode(run))
        .ok()?;
    let text = String::from_utf8(bytes).ok()?;
    mostly_printable(&text).then_some(text)
}

fn mostly_printable(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let printable = text
        .chars()
        .filter(|c| !c.is_control() || c.is_ascii_whitespace())
        .count();
    printable * 10 >= text.chars().count() * 8
}

/// Collapse `b.y.p.a.s.s` and `i g n o r e` style sequences back into words.
fn collapse_split_letters(line: &str) -> Option<String> {
    let mut collapsed = line.to_string();
    let mut changed = false;

    for m in DOTTED_LETTERS.find_iter(line) {
        let joined: String = m.as_str().chars().filter(|c| c.is_ascii_alphabetic()).collect();
        collapsed = collapsed.replace(m.as_str(), &joined);
        changed = true;
    }
    for m in SPACED_LETTERS.find_iter(line) {
        let joined: String = m.as_str().chars().filter(|c| c.is_ascii_alphabetic()).collect();
        collapsed = collapsed.replace(m.as_str(), &joined);
        changed = true;
    }

    changed.then_some(collapsed)
}
