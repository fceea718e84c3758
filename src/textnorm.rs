//! Arabic text normalization and lexical cues.
//!
//! All comparisons that decide whether two surface forms are "the same text"
//! go through [`normalize`] (NFC + whitespace collapse) or [`fold_key`]
//! (normalize + diacritic strip), so that a candidate differing from a
//! must-not-heading entry only in diacritics still matches.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

/// Heading tokens that open chapter- or section-grade Arabic headings.
pub const HEADING_TOKENS: &[&str] = &[
    "باب",
    "فصل",
    "كتاب",
    "تنبيه",
    "قاعدة",
    "فائدة",
    "مسألة",
    "تمهيد",
    "مقدمة",
    "خاتمة",
];

/// Chapter-grade subset of [`HEADING_TOKENS`]: evidence for a level-2 parent.
pub const CHAPTER_TOKENS: &[&str] = &["باب", "كتاب", "مقدمة", "خاتمة"];

/// Tokens marking exercise/application sections.
pub const EXERCISE_TOKENS: &[&str] = &[
    "أسئلة",
    "سؤال",
    "تمرين",
    "تمارين",
    "تطبيق",
    "تدريبات",
    "اختبار",
];

/// Title-page tokens identifying metadata zones.
pub const METADATA_TOKENS: &[&str] = &["المؤلف", "الناشر", "الطبعة", "تحقيق", "حقوق"];

/// Embedded table-of-contents hints.
pub const TOC_TOKENS: &[&str] = &["فهرس", "المحتويات"];

fn ws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\w؀-ۿ]+").unwrap())
}

/// NFC-normalize and collapse whitespace. ZWNJ and NBSP count as whitespace.
pub fn normalize(text: &str) -> String {
    let nfc: String = text
        .nfc()
        .map(|c| match c {
            '\u{200c}' | '\u{a0}' => ' ',
            other => other,
        })
        .collect();
    ws_re().replace_all(nfc.trim(), " ").into_owned()
}

/// True for Arabic combining marks and the tatweel, which carry no lexical
/// identity for matching purposes.
fn is_diacritic(c: char) -> bool {
    matches!(c,
        '\u{0610}'..='\u{061a}'
        | '\u{064b}'..='\u{065f}'
        | '\u{0670}'
        | '\u{06d6}'..='\u{06dc}'
        | '\u{06df}'..='\u{06e8}'
        | '\u{06ea}'..='\u{06ed}'
        | '\u{0640}')
}

/// Matching key: [`normalize`] then strip diacritics. This is the equality
/// used against the must-not-heading fixture.
pub fn fold_key(text: &str) -> String {
    normalize(text).chars().filter(|c| !is_diacritic(*c)).collect()
}

/// Lowercased token set over Arabic and word characters, diacritics stripped.
/// Used by the placement planner's Jaccard similarity.
pub fn token_set(text: &str) -> BTreeSet<String> {
    token_re()
        .find_iter(&fold_key(text))
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Jaccard similarity of the two token sets; 0.0 when either is empty.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        inter as f64 / union as f64
    }
}

/// Does the text open with a recognized heading token (optionally trailed by
/// an Arabic-Indic or Western numeral)?
pub fn begins_with_heading_token(text: &str) -> bool {
    let normalized = normalize(text);
    let first = match normalized.split_whitespace().next() {
        Some(w) => w,
        None => return false,
    };
    let first = first.trim_end_matches([':', '،', '.']);
    HEADING_TOKENS.iter().any(|t| first == *t)
}

/// Is the word after the heading token a numeral (Arabic-Indic or Western)?
pub fn heading_token_followed_by_numeral(text: &str) -> bool {
    let normalized = normalize(text);
    let mut words = normalized.split_whitespace();
    let Some(first) = words.next() else {
        return false;
    };
    let first = first.trim_end_matches([':', '،', '.']);
    if !HEADING_TOKENS.contains(&first) {
        return false;
    }
    words
        .next()
        .map(|w| w.chars().all(|c| c.is_ascii_digit() || ('\u{0660}'..='\u{0669}').contains(&c)))
        .unwrap_or(false)
}

/// Exercise-family detection on a normalized heading.
pub fn is_exercise_text(text: &str) -> bool {
    let key = fold_key(text);
    EXERCISE_TOKENS.iter().any(|t| key.contains(t))
}

pub fn contains_metadata_token(text: &str) -> bool {
    METADATA_TOKENS.iter().any(|t| text.contains(t))
}

pub fn contains_toc_token(text: &str) -> bool {
    TOC_TOKENS.iter().any(|t| text.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_zwnj() {
        assert_eq!(normalize("  باب \u{200c} الإدغام \n"), "باب الإدغام");
        assert_eq!(normalize("a\u{a0}b"), "a b");
    }

    #[test]
    fn fold_key_strips_diacritics() {
        // بَاب vs باب differ only in fatha
        assert_eq!(fold_key("بَاب"), fold_key("باب"));
        assert_ne!(normalize("بَاب"), normalize("باب"));
    }

    #[test]
    fn heading_token_detection() {
        assert!(begins_with_heading_token("باب الإدغام"));
        assert!(begins_with_heading_token("مسألة: في كذا"));
        assert!(!begins_with_heading_token("وهذا باب آخر"));
        assert!(heading_token_followed_by_numeral("فصل ٣"));
        assert!(heading_token_followed_by_numeral("باب 12"));
        assert!(!heading_token_followed_by_numeral("باب الإدغام"));
    }

    #[test]
    fn exercise_detection_survives_diacritics() {
        assert!(is_exercise_text("تمارين وتطبيقات"));
        assert!(is_exercise_text("أسئلة الدرس"));
        assert!(!is_exercise_text("باب الصرف"));
    }

    #[test]
    fn jaccard_basics() {
        let a = token_set("باب الإدغام في الصرف");
        let b = token_set("الإدغام باب");
        assert!(jaccard(&a, &b) > 0.5);
        assert_eq!(jaccard(&a, &BTreeSet::new()), 0.0);
    }
}
