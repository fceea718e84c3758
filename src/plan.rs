//! Plan builder: merges Layer B/C decisions into the proposal artifact.
//!
//! The proposal is the reviewable unit of the first gate. Every candidate
//! that qualifies (rule-accepted, or ambiguous with an affirmative oracle
//! verdict) becomes a [`ProposedInjection`]; candidates blocked by the
//! must-not-heading fixture are present as blocked rows, never silently
//! omitted. All rows carry `review_required = true` — the oracle advises,
//! it never authorizes.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::candidates::CandidateSeed;
use crate::dom::NormalizedFile;
use crate::models::{
    Decision, DecisionBasis, OracleVerdict, ProposedInjection, Score, Suggestion,
};

/// The sole anchor rule. Nothing else ever starts a chunk.
pub const STRICT_ANCHOR_PATTERN: &str = r"^#{2,6}\s+";

pub fn anchor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(STRICT_ANCHOR_PATTERN).unwrap())
}

/// What Layer C produced for one candidate, if it was consulted.
#[derive(Debug, Clone, Default)]
pub struct OracleOutcomeRecord {
    pub verdict: Option<OracleVerdict>,
    pub from_cache: bool,
    pub error: bool,
}

/// Merge scores with oracle outcomes back into canonical candidate order.
/// Oracle replies may arrive in any order; this is where they are folded
/// back deterministically.
pub fn merge_decisions(
    scores: &[Score],
    oracle: &BTreeMap<String, OracleOutcomeRecord>,
) -> Vec<Decision> {
    scores
        .iter()
        .map(|score| {
            let record = oracle.get(&score.candidate_id);
            let verdict = record.and_then(|r| r.verdict.clone());
            let error = record.map(|r| r.error).unwrap_or(false);
            let basis = match (&verdict, score.suggested_is_heading) {
                (Some(_), Suggestion::Unknown) if score.score >= 0.5 => DecisionBasis::RuleOracle,
                (Some(_), _) => DecisionBasis::Oracle,
                (None, _) => DecisionBasis::Rule,
            };
            Decision {
                candidate_id: score.candidate_id.clone(),
                score: score.clone(),
                basis,
                oracle: verdict,
                oracle_error: error,
            }
        })
        .collect()
}

/// Assemble the ordered proposal. `override_must_not` lifts the block for
/// audited runs; every lifted row is logged.
pub fn build_proposal(
    seeds: &[CandidateSeed],
    decisions: &[Decision],
    override_must_not: bool,
) -> Vec<ProposedInjection> {
    let by_id: BTreeMap<&str, &Decision> = decisions
        .iter()
        .map(|d| (d.candidate_id.as_str(), d))
        .collect();

    let mut rows = Vec::new();
    for seed in seeds {
        let cand = &seed.candidate;
        let Some(decision) = by_id.get(cand.candidate_id.as_str()) else {
            continue;
        };
        let score = &decision.score;

        if score.must_not_match {
            if override_must_not {
                tracing::warn!(
                    candidate_id = %cand.candidate_id,
                    text = %cand.text,
                    "must-not-heading override applied by auditor flag"
                );
                rows.push(ProposedInjection {
                    candidate_id: cand.candidate_id.clone(),
                    signature: cand.signature.clone(),
                    file: cand.file.clone(),
                    file_index: cand.file_index,
                    insertion_offset: cand.start_offset,
                    level: score.suggested_level,
                    title_text: cand.text.clone(),
                    decision_basis: decision.basis,
                    score: score.score,
                    oracle_result: decision.oracle.clone(),
                    blocked_by_must_not_heading: false,
                    review_required: true,
                });
            } else {
                rows.push(ProposedInjection {
                    candidate_id: cand.candidate_id.clone(),
                    signature: cand.signature.clone(),
                    file: cand.file.clone(),
                    file_index: cand.file_index,
                    insertion_offset: cand.start_offset,
                    level: score.suggested_level,
                    title_text: cand.text.clone(),
                    decision_basis: decision.basis,
                    score: score.score,
                    oracle_result: decision.oracle.clone(),
                    blocked_by_must_not_heading: true,
                    review_required: true,
                });
            }
            continue;
        }

        let rule_yes = score.suggested_is_heading == Suggestion::True;
        let oracle_yes = decision
            .oracle
            .as_ref()
            .map(|v| v.is_heading)
            .unwrap_or(false);
        if !(rule_yes || oracle_yes) {
            continue;
        }

        let level = if rule_yes {
            score.suggested_level
        } else {
            decision
                .oracle
                .as_ref()
                .map(|v| v.level.clamp(2, 3))
                .unwrap_or(score.suggested_level)
        };

        rows.push(ProposedInjection {
            candidate_id: cand.candidate_id.clone(),
            signature: cand.signature.clone(),
            file: cand.file.clone(),
            file_index: cand.file_index,
            insertion_offset: cand.start_offset,
            level,
            title_text: cand.text.clone(),
            decision_basis: decision.basis,
            score: score.score,
            oracle_result: decision.oracle.clone(),
            blocked_by_must_not_heading: false,
            review_required: true,
        });
    }

    rows.sort_by(|a, b| {
        (a.file_index, a.insertion_offset).cmp(&(b.file_index, b.insertion_offset))
    });
    rows
}

/// An ambiguous candidate surfaced in the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbiguousEntry {
    pub candidate_id: String,
    pub text: String,
    pub score: f64,
    pub oracle_error: bool,
}

/// Counts and estimates for the human-readable report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalSummary {
    pub candidate_count: usize,
    pub proposed_count: usize,
    pub blocked_count: usize,
    pub ambiguous_count: usize,
    pub oracle_error_count: usize,
    pub counts_by_kind: BTreeMap<String, usize>,
    pub score_bands: BTreeMap<String, usize>,
    /// `^#{2,6}\s+` matches in the unmodified derived markup.
    pub anchors_before: usize,
    /// Anchors after adding the proposed injection points.
    pub anchors_after: usize,
    pub anchor_miss_before: usize,
    pub anchor_miss_after_estimate: usize,
    pub anchor_miss_relative_reduction_estimate: f64,
    pub top_ambiguous: Vec<AmbiguousEntry>,
}

const TOP_AMBIGUOUS: usize = 10;

/// Compute the proposal summary over the merged decisions.
pub fn summarize(
    seeds: &[CandidateSeed],
    decisions: &[Decision],
    proposals: &[ProposedInjection],
    files: &[NormalizedFile],
) -> ProposalSummary {
    let mut counts_by_kind: BTreeMap<String, usize> = BTreeMap::new();
    for seed in seeds {
        let kind = serde_json::to_string(&seed.candidate.kind)
            .unwrap_or_default()
            .trim_matches('"')
            .to_string();
        *counts_by_kind.entry(kind).or_insert(0) += 1;
    }

    let mut score_bands: BTreeMap<String, usize> = BTreeMap::new();
    for d in decisions {
        let band = match d.score.score {
            s if s >= 0.75 => "0.75-1.00",
            s if s >= 0.50 => "0.50-0.75",
            s if s >= 0.25 => "0.25-0.50",
            _ => "0.00-0.25",
        };
        *score_bands.entry(band.to_string()).or_insert(0) += 1;
    }

    let text_by_id: BTreeMap<&str, &str> = seeds
        .iter()
        .map(|s| (s.candidate.candidate_id.as_str(), s.candidate.text.as_str()))
        .collect();

    let mut ambiguous: Vec<AmbiguousEntry> = decisions
        .iter()
        .filter(|d| d.score.suggested_is_heading == Suggestion::Unknown)
        .map(|d| AmbiguousEntry {
            candidate_id: d.candidate_id.clone(),
            text: text_by_id
                .get(d.candidate_id.as_str())
                .copied()
                .unwrap_or("")
                .to_string(),
            score: d.score.score,
            oracle_error: d.oracle_error,
        })
        .collect();
    let ambiguous_count = ambiguous.len();
    // Closest-to-0.5 first: the ones a reviewer should look at.
    ambiguous.sort_by(|a, b| {
        let da = (a.score - 0.5).abs();
        let db = (b.score - 0.5).abs();
        da.partial_cmp(&db)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.candidate_id.cmp(&b.candidate_id))
    });
    ambiguous.truncate(TOP_AMBIGUOUS);

    let anchors_before: usize = files
        .iter()
        .map(|f| f.markup.lines().filter(|l| anchor_re().is_match(l)).count())
        .sum();
    let proposed_count = proposals
        .iter()
        .filter(|p| !p.blocked_by_must_not_heading)
        .count();
    let anchors_after = anchors_before + proposed_count;

    // Anchor-miss model: every candidate is a potential boundary the
    // unmodified markup misses; injections close that gap.
    let anchor_miss_before = seeds.len().saturating_sub(anchors_before).max(1);
    let anchor_miss_after = anchor_miss_before.saturating_sub(proposed_count);
    let relative_reduction = if anchor_miss_before == 0 {
        if anchor_miss_after == 0 {
            0.0
        } else {
            -1.0
        }
    } else {
        (anchor_miss_before - anchor_miss_after) as f64 / anchor_miss_before as f64
    };

    ProposalSummary {
        candidate_count: seeds.len(),
        proposed_count,
        blocked_count: proposals
            .iter()
            .filter(|p| p.blocked_by_must_not_heading)
            .count(),
        ambiguous_count,
        oracle_error_count: decisions.iter().filter(|d| d.oracle_error).count(),
        counts_by_kind,
        score_bands,
        anchors_before,
        anchors_after,
        anchor_miss_before,
        anchor_miss_after_estimate: anchor_miss_after,
        anchor_miss_relative_reduction_estimate: relative_reduction,
        top_ambiguous: ambiguous,
    }
}
