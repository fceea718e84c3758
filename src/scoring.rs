//! Layer B: deterministic candidate scoring.
//!
//! Each candidate gets a signed feature sum squashed through a logistic into
//! [0, 1]. Thresholds split the range into accepted / rejected / ambiguous;
//! only ambiguous candidates are eligible for the oracle. A candidate whose
//! folded text matches the must-not-heading fixture is hard-blocked no matter
//! what the features say.

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::Path;

use crate::artifacts;
use crate::candidates::CandidateSeed;
use crate::config::ScoringConfig;
use crate::dom::BookProfile;
use crate::models::{CandidateKind, ReasonTag, Score, Suggestion};
use crate::textnorm;

/// Signature repetition ratio above which a candidate is treated as a
/// running header for scoring purposes.
const PAGEHEAD_REPEAT_RATIO: f64 = 0.4;

/// Fraction of the document counted as "edge" position.
const EDGE_FRACTION: f64 = 0.02;

/// Logistic squash midpoint: a feature sum of 3 maps to score 0.5.
const LOGISTIC_BIAS: f64 = 3.0;

/// Load the must-not-heading fixture: one JSON object per line with a
/// `text` (or `snippet`) field. Comparison keys are NFC + diacritic-stripped.
pub fn load_must_not(path: &Path) -> Result<BTreeSet<String>> {
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let rows: Vec<serde_json::Value> = artifacts::read_jsonl(path)?;
    let mut blocked = BTreeSet::new();
    for row in rows {
        let text = row
            .get("text")
            .or_else(|| row.get("snippet"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if !text.is_empty() {
            blocked.insert(textnorm::fold_key(text));
        }
    }
    Ok(blocked)
}

fn logistic(sum: f64) -> f64 {
    1.0 / (1.0 + (-(sum - LOGISTIC_BIAS)).exp())
}

fn reason_for(kind: CandidateKind, is_heading: Suggestion) -> ReasonTag {
    match kind {
        CandidateKind::Pagehead => ReasonTag::Pagehead,
        CandidateKind::Footnote => ReasonTag::Footnote,
        CandidateKind::Metadata => ReasonTag::Metadata,
        _ => {
            if is_heading == Suggestion::True {
                ReasonTag::Title
            } else {
                ReasonTag::BodyLine
            }
        }
    }
}

/// Score every candidate of a book in canonical order.
///
/// Level policy: level 3 is assigned only when a chapter-grade heading was
/// already accepted earlier in the same file and the current text opens with
/// a subordinate token; everything else defaults to level 2 and records the
/// uncertainty in the rationale.
pub fn score_book(
    seeds: &[CandidateSeed],
    profile: &BookProfile,
    must_not: &BTreeSet<String>,
    cfg: &ScoringConfig,
) -> Vec<Score> {
    let total = seeds.len().max(1);
    let mut scores = Vec::with_capacity(seeds.len());
    let mut chapter_seen_in_file: Option<usize> = None;

    for (i, seed) in seeds.iter().enumerate() {
        let doc_fraction = i as f64 / total as f64;
        let chapter_seen = chapter_seen_in_file == Some(seed.candidate.file_index);
        let score = score_one(seed, profile, must_not, cfg, doc_fraction, chapter_seen);

        if score.suggested_is_heading == Suggestion::True {
            let text = &seed.candidate.text;
            let chapter_grade = textnorm::CHAPTER_TOKENS
                .iter()
                .any(|t| textnorm::normalize(text).starts_with(t))
                || seed.features.font_larger;
            if chapter_grade {
                chapter_seen_in_file = Some(seed.candidate.file_index);
            }
        }
        scores.push(score);
    }

    scores
}

fn score_one(
    seed: &CandidateSeed,
    profile: &BookProfile,
    must_not: &BTreeSet<String>,
    cfg: &ScoringConfig,
    doc_fraction: f64,
    chapter_seen_in_file: bool,
) -> Score {
    let cand = &seed.candidate;
    let f = &seed.features;
    let mut rationale: Vec<String> = Vec::new();

    // Must-not-heading: hard block before anything else.
    if must_not.contains(&textnorm::fold_key(&cand.text)) {
        rationale.push("blocked_by_must_not_heading".into());
        return Score {
            candidate_id: cand.candidate_id.clone(),
            score: 0.0,
            suggested_is_heading: Suggestion::False,
            suggested_level: 2,
            reason: reason_for(cand.kind, Suggestion::False),
            confidence: 1.0,
            must_not_match: true,
            rationale,
        };
    }

    let mut sum = 0.0;
    let mut push = |rationale: &mut Vec<String>, tag: &str, delta: f64, sum: &mut f64| {
        *sum += delta;
        rationale.push(tag.to_string());
    };

    // Structural.
    if f.isolated {
        push(&mut rationale, "isolated_block", 1.0, &mut sum);
    }
    if f.centered {
        push(&mut rationale, "centered", 1.0, &mut sum);
    }
    if f.bold {
        push(&mut rationale, "bold", 1.0, &mut sum);
    }
    if f.title_class {
        push(&mut rationale, "title_span_class", 1.0, &mut sum);
    }
    if f.preceded_by_hr {
        push(&mut rationale, "preceded_by_hr", 1.0, &mut sum);
    }

    // Lexical.
    if textnorm::begins_with_heading_token(&cand.text) {
        push(&mut rationale, "heading_token", 1.0, &mut sum);
    }
    if textnorm::heading_token_followed_by_numeral(&cand.text) {
        push(&mut rationale, "numbered_heading", 1.0, &mut sum);
    }
    let token_count = cand.text.split_whitespace().count();
    if (2..=8).contains(&token_count) {
        push(&mut rationale, "title_length", 1.0, &mut sum);
    }
    let ends_with_punct = cand
        .text
        .chars()
        .last()
        .map(|c| matches!(c, '.' | '،' | ':' | '؛' | '!' | '؟' | ','))
        .unwrap_or(false);
    if !ends_with_punct {
        push(&mut rationale, "no_trailing_punctuation", 1.0, &mut sum);
    }

    // Positional (negative).
    let mut negative_structural = false;
    if f.in_metadata_zone {
        push(&mut rationale, "metadata_zone", -1.0, &mut sum);
        negative_structural = true;
    }
    if f.in_footnote_zone {
        push(&mut rationale, "footnote_zone", -1.0, &mut sum);
        negative_structural = true;
    }
    let sig_ratio = profile.signature_ratio(&f.repetition_key);
    if f.is_pagehead || sig_ratio >= PAGEHEAD_REPEAT_RATIO {
        push(&mut rationale, "pagehead_repetition", -1.0, &mut sum);
        negative_structural = true;
    }
    if doc_fraction < EDGE_FRACTION || doc_fraction > 1.0 - EDGE_FRACTION {
        push(&mut rationale, "document_edge", -0.5, &mut sum);
    }

    let score = logistic(sum);

    // Conflicting features: a line that looks emphasized but sits in a noise
    // zone cannot be decided deterministically. Route to review.
    let positive_emphasis = f.centered || f.bold || f.title_class;
    let anomaly = positive_emphasis && (f.in_footnote_zone || f.in_metadata_zone);
    if anomaly {
        rationale.push("conflicting_features".into());
    }

    let suggestion = if anomaly {
        Suggestion::Unknown
    } else if score >= cfg.accept_threshold && !negative_structural {
        Suggestion::True
    } else if score <= cfg.reject_threshold {
        Suggestion::False
    } else {
        Suggestion::Unknown
    };

    let level = if suggestion == Suggestion::True {
        let normalized = textnorm::normalize(&cand.text);
        let subordinate = ["فصل", "مسألة", "تنبيه", "فائدة", "قاعدة"]
            .iter()
            .any(|t| normalized.starts_with(t));
        if subordinate && chapter_seen_in_file {
            rationale.push("level3_hierarchical_evidence".into());
            3
        } else {
            if subordinate {
                rationale.push("level2_no_parent_evidence".into());
            }
            2
        }
    } else {
        2
    };

    let confidence = match suggestion {
        Suggestion::True => score,
        Suggestion::False => 1.0 - score,
        Suggestion::Unknown => score,
    };

    Score {
        candidate_id: cand.candidate_id.clone(),
        score,
        suggested_is_heading: suggestion,
        suggested_level: level,
        reason: reason_for(cand.kind, suggestion),
        confidence,
        must_not_match: false,
        rationale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::StructuralFeatures;
    use crate::models::Candidate;

    fn seed(text: &str, kind: CandidateKind, features: StructuralFeatures) -> CandidateSeed {
        CandidateSeed {
            candidate: Candidate {
                candidate_id: format!("id-{text}"),
                text: text.to_string(),
                kind,
                signature: "sig".into(),
                context_before: String::new(),
                context_after: String::new(),
                html_excerpt: String::new(),
                dom_path: "/html[1]/body[1]/p[1]".into(),
                page_index: None,
                file: "001.html".into(),
                file_index: 0,
                start_offset: 0,
                end_offset: 0,
            },
            features,
        }
    }

    fn plain_features() -> StructuralFeatures {
        StructuralFeatures {
            isolated: false,
            centered: false,
            bold: false,
            font_larger: false,
            title_class: false,
            preceded_by_hr: false,
            in_metadata_zone: false,
            in_footnote_zone: false,
            is_pagehead: false,
            repetition_key: "sig".into(),
        }
    }

    fn strong_features() -> StructuralFeatures {
        StructuralFeatures {
            isolated: true,
            centered: true,
            bold: true,
            preceded_by_hr: true,
            ..plain_features()
        }
    }

    fn ctx() -> (BookProfile, BTreeSet<String>, ScoringConfig) {
        (
            BookProfile::default(),
            BTreeSet::new(),
            ScoringConfig::default(),
        )
    }

    #[test]
    fn strong_chapter_heading_scores_high() {
        let (profile, must_not, cfg) = ctx();
        // Positioned mid-document so the edge penalty does not fire.
        let seeds: Vec<CandidateSeed> = (0..10)
            .map(|i| {
                if i == 5 {
                    seed("باب الإدغام", CandidateKind::Title, strong_features())
                } else {
                    seed(&format!("نص {i}"), CandidateKind::Body, plain_features())
                }
            })
            .collect();
        let scores = score_book(&seeds, &profile, &must_not, &cfg);
        let s = &scores[5];
        assert!(s.score >= 0.75, "score = {}", s.score);
        assert_eq!(s.suggested_is_heading, Suggestion::True);
        assert_eq!(s.suggested_level, 2);
        assert_eq!(s.reason, ReasonTag::Title);
    }

    #[test]
    fn must_not_entry_is_hard_blocked_even_with_strong_features() {
        let (profile, _, cfg) = ctx();
        let mut must_not = BTreeSet::new();
        must_not.insert(textnorm::fold_key("مسألة:"));
        let seeds = vec![seed("مسألة:", CandidateKind::Title, strong_features())];
        let scores = score_book(&seeds, &profile, &must_not, &cfg);
        assert!(scores[0].must_not_match);
        assert_eq!(scores[0].score, 0.0);
        assert_eq!(scores[0].suggested_is_heading, Suggestion::False);
    }

    #[test]
    fn must_not_matches_across_diacritics() {
        let (profile, _, cfg) = ctx();
        let mut must_not = BTreeSet::new();
        must_not.insert(textnorm::fold_key("مسألة"));
        // Same word with a fatha.
        let seeds = vec![seed("مسْألَة", CandidateKind::Title, strong_features())];
        let scores = score_book(&seeds, &profile, &must_not, &cfg);
        assert!(scores[0].must_not_match);
    }

    #[test]
    fn bold_line_without_context_is_ambiguous() {
        let (profile, must_not, cfg) = ctx();
        let mut features = plain_features();
        features.bold = true;
        let seeds: Vec<CandidateSeed> = (0..10)
            .map(|i| {
                if i == 5 {
                    seed("تنبيه", CandidateKind::Title, features.clone())
                } else {
                    seed(&format!("نص {i}"), CandidateKind::Body, plain_features())
                }
            })
            .collect();
        let scores = score_book(&seeds, &profile, &must_not, &cfg);
        assert_eq!(scores[5].suggested_is_heading, Suggestion::Unknown);
    }

    #[test]
    fn pagehead_repetition_is_negative() {
        let (mut profile, must_not, cfg) = ctx();
        profile.signature_page_ratio.insert("sig".into(), 0.9);
        let seeds = vec![seed("تفسير ابن كثير", CandidateKind::Pagehead, plain_features())];
        let scores = score_book(&seeds, &profile, &must_not, &cfg);
        assert_ne!(scores[0].suggested_is_heading, Suggestion::True);
        assert!(scores[0].rationale.iter().any(|r| r == "pagehead_repetition"));
        assert_eq!(scores[0].reason, ReasonTag::Pagehead);
    }

    #[test]
    fn conflicting_features_force_unknown() {
        let (profile, must_not, cfg) = ctx();
        let mut features = strong_features();
        features.in_footnote_zone = true;
        let seeds = vec![seed("باب في الحاشية", CandidateKind::Footnote, features)];
        let scores = score_book(&seeds, &profile, &must_not, &cfg);
        assert_eq!(scores[0].suggested_is_heading, Suggestion::Unknown);
        assert!(scores[0].rationale.iter().any(|r| r == "conflicting_features"));
    }

    #[test]
    fn subordinate_token_gets_level3_after_chapter() {
        let (profile, must_not, cfg) = ctx();
        let seeds: Vec<CandidateSeed> = {
            let mut v: Vec<CandidateSeed> = (0..20)
                .map(|i| seed(&format!("نص {i}"), CandidateKind::Body, plain_features()))
                .collect();
            v[5] = seed("باب الصرف", CandidateKind::Title, strong_features());
            v[10] = seed("فصل في الميزان", CandidateKind::Title, strong_features());
            v
        };
        let scores = score_book(&seeds, &profile, &must_not, &cfg);
        assert_eq!(scores[5].suggested_level, 2);
        assert_eq!(scores[10].suggested_level, 3);
        assert!(scores[10]
            .rationale
            .iter()
            .any(|r| r == "level3_hierarchical_evidence"));
    }

    #[test]
    fn subordinate_token_without_parent_stays_level2() {
        let (profile, must_not, cfg) = ctx();
        let mut seeds: Vec<CandidateSeed> = (0..20)
            .map(|i| seed(&format!("نص {i}"), CandidateKind::Body, plain_features()))
            .collect();
        seeds[10] = seed("فصل في الميزان", CandidateKind::Title, strong_features());
        let scores = score_book(&seeds, &profile, &must_not, &cfg);
        assert_eq!(scores[10].suggested_level, 2);
    }
}
