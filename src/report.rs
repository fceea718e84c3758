//! Run report emission: anchor metrics, guardrails, gold-split false
//! positives, and per-injection traceability.
//!
//! The report is the run's QA record. Guardrail violations mark it FAILED;
//! a failed report blocks the commit stage. No wall-clock values are
//! embedded, so reruns with a pinned run id produce byte-identical reports.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::artifacts;
use crate::models::{ApprovedInjection, Decision, ProposedInjection, Suggestion};
use crate::plan::ProposalSummary;

/// A gold-labelled snippet from the train/holdout split fixtures.
#[derive(Debug, Clone, Deserialize)]
pub struct GoldRow {
    pub candidate_id: String,
    pub gold: GoldLabel,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoldLabel {
    pub is_heading: bool,
}

/// False-positive rate over the negative half of one split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitFpMetrics {
    pub split_name: String,
    pub negative_total: usize,
    pub false_positives: usize,
    pub fp_rate: f64,
}

/// One row of the per-injection traceability table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceabilityRow {
    pub candidate_id: String,
    pub approved: bool,
    pub score: f64,
    pub signature: String,
    pub location: String,
    pub excerpt: String,
}

/// A must-not-heading entry that was predicted as a heading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MustNotViolationRow {
    pub candidate_id: String,
    pub text: String,
    pub signature: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub book_id: String,
    /// `passed` or `failed`.
    pub status: String,
    pub summary: ProposalSummary,
    pub must_not_violations: Vec<MustNotViolationRow>,
    pub train_fp: SplitFpMetrics,
    pub holdout_fp: SplitFpMetrics,
    pub holdout_regression: bool,
    pub traceability: Vec<TraceabilityRow>,
    pub guardrail_violations: Vec<String>,
}

pub fn load_gold_split(path: &Path) -> Result<Vec<GoldRow>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    artifacts::read_jsonl(path)
}

fn predicted_heading(decision: &Decision) -> bool {
    decision.score.suggested_is_heading == Suggestion::True
        || decision
            .oracle
            .as_ref()
            .map(|v| v.is_heading)
            .unwrap_or(false)
}

/// False positives on one split: gold-negative candidates the pipeline
/// predicted as headings.
pub fn split_fp(split_name: &str, rows: &[GoldRow], decisions: &[Decision]) -> SplitFpMetrics {
    let by_id: BTreeMap<&str, &Decision> = decisions
        .iter()
        .map(|d| (d.candidate_id.as_str(), d))
        .collect();

    let negatives: Vec<&GoldRow> = rows.iter().filter(|r| !r.gold.is_heading).collect();
    let false_positives = negatives
        .iter()
        .filter(|r| {
            by_id
                .get(r.candidate_id.as_str())
                .map(|d| predicted_heading(d))
                .unwrap_or(false)
        })
        .count();
    let negative_total = negatives.len();
    SplitFpMetrics {
        split_name: split_name.to_string(),
        negative_total,
        false_positives,
        fp_rate: if negative_total == 0 {
            0.0
        } else {
            false_positives as f64 / negative_total as f64
        },
    }
}

/// Assemble the run report and evaluate the guardrails.
#[allow(clippy::too_many_arguments)]
pub fn build_report(
    run_id: &str,
    book_id: &str,
    summary: ProposalSummary,
    decisions: &[Decision],
    proposed: &[ProposedInjection],
    approved: &[ApprovedInjection],
    train_rows: &[GoldRow],
    holdout_rows: &[GoldRow],
    minimum_relative_reduction: f64,
) -> RunReport {
    // Must-not rows that would have been injected without the block.
    let must_not_violations: Vec<MustNotViolationRow> = proposed
        .iter()
        .filter(|p| p.blocked_by_must_not_heading)
        .map(|p| MustNotViolationRow {
            candidate_id: p.candidate_id.clone(),
            text: p.title_text.clone(),
            signature: p.signature.clone(),
            reason: "blocked by must-not-heading".to_string(),
        })
        .collect();

    let train_fp = split_fp("train", train_rows, decisions);
    let holdout_fp = split_fp("holdout", holdout_rows, decisions);
    let holdout_regression = holdout_fp.fp_rate > train_fp.fp_rate;

    let approved_ids: BTreeMap<&str, &ApprovedInjection> = approved
        .iter()
        .map(|a| (a.candidate_id.as_str(), a))
        .collect();
    let traceability: Vec<TraceabilityRow> = proposed
        .iter()
        .filter(|p| !p.blocked_by_must_not_heading)
        .map(|p| TraceabilityRow {
            candidate_id: p.candidate_id.clone(),
            approved: approved_ids.contains_key(p.candidate_id.as_str()),
            score: p.score,
            signature: p.signature.clone(),
            location: format!("{}:{}", p.file, p.insertion_offset),
            excerpt: p.title_text.clone(),
        })
        .collect();

    let mut guardrails: Vec<String> = Vec::new();
    if summary.anchor_miss_after_estimate >= summary.anchor_miss_before
        && summary.proposed_count > 0
    {
        guardrails.push("anchor_miss_after must be lower than anchor_miss_before".to_string());
    }
    if summary.anchor_miss_relative_reduction_estimate < minimum_relative_reduction {
        guardrails.push(format!(
            "anchor miss relative reduction {:.4} is below minimum {:.4}",
            summary.anchor_miss_relative_reduction_estimate, minimum_relative_reduction
        ));
    }
    if holdout_regression {
        guardrails.push(format!(
            "holdout FP rate regression: holdout={:.4} train={:.4}",
            holdout_fp.fp_rate, train_fp.fp_rate
        ));
    }

    let status = if guardrails.is_empty() { "passed" } else { "failed" };
    RunReport {
        run_id: run_id.to_string(),
        book_id: book_id.to_string(),
        status: status.to_string(),
        summary,
        must_not_violations,
        train_fp,
        holdout_fp,
        holdout_regression,
        traceability,
        guardrail_violations: guardrails,
    }
}

/// Write `run_report.json` and `run_report.md`.
pub fn write_report(dir: &Path, report: &RunReport) -> Result<()> {
    artifacts::write_json(&dir.join("run_report.json"), report)?;
    artifacts::write_atomic(&dir.join("run_report.md"), render_markdown(report).as_bytes())
}

fn render_markdown(report: &RunReport) -> String {
    let mut lines = vec![
        format!("# Run report: {} / {}", report.run_id, report.book_id),
        String::new(),
        format!("- Status: **{}**", report.status.to_uppercase()),
        String::new(),
        "## Anchor miss".to_string(),
        format!("- before: `{}`", report.summary.anchor_miss_before),
        format!(
            "- after (estimate): `{}`",
            report.summary.anchor_miss_after_estimate
        ),
        format!(
            "- relative reduction: `{:.4}`",
            report.summary.anchor_miss_relative_reduction_estimate
        ),
        String::new(),
        "## Candidates".to_string(),
        format!("- total: `{}`", report.summary.candidate_count),
        format!("- proposed injections: `{}`", report.summary.proposed_count),
        format!(
            "- blocked by must-not-heading: `{}`",
            report.summary.blocked_count
        ),
        format!("- ambiguous: `{}`", report.summary.ambiguous_count),
        format!("- oracle errors: `{}`", report.summary.oracle_error_count),
    ];

    if !report.summary.counts_by_kind.is_empty() {
        lines.push(String::new());
        lines.push("### By kind".to_string());
        for (kind, n) in &report.summary.counts_by_kind {
            lines.push(format!("- {kind}: `{n}`"));
        }
    }
    if !report.summary.score_bands.is_empty() {
        lines.push(String::new());
        lines.push("### Score bands".to_string());
        for (band, n) in &report.summary.score_bands {
            lines.push(format!("- {band}: `{n}`"));
        }
    }

    if !report.summary.top_ambiguous.is_empty() {
        lines.push(String::new());
        lines.push("### Top ambiguous candidates".to_string());
        for entry in &report.summary.top_ambiguous {
            lines.push(format!(
                "- `{}` | score `{:.4}`{} | {}",
                entry.candidate_id,
                entry.score,
                if entry.oracle_error { " | oracle_error" } else { "" },
                entry.text
            ));
        }
    }

    lines.push(String::new());
    lines.push("## Must-not-heading guardrail".to_string());
    lines.push(format!(
        "- blocked rows: `{}`",
        report.must_not_violations.len()
    ));
    for v in &report.must_not_violations {
        lines.push(format!(
            "- `{}` | `{}` | {} | {}",
            v.candidate_id, v.signature, v.reason, v.text
        ));
    }

    lines.push(String::new());
    lines.push("## False-positive comparison".to_string());
    for fp in [&report.train_fp, &report.holdout_fp] {
        lines.push(format!(
            "- {} fp: `{}/{}` (rate `{:.4}`)",
            fp.split_name, fp.false_positives, fp.negative_total, fp.fp_rate
        ));
    }
    lines.push(format!(
        "- holdout regression: `{}`",
        report.holdout_regression
    ));

    lines.push(String::new());
    lines.push("## Per-injection traceability".to_string());
    lines.push("| candidate_id | approved | score | signature | location | excerpt |".to_string());
    lines.push("|---|---:|---:|---|---|---|".to_string());
    for row in &report.traceability {
        let excerpt = row.excerpt.replace('|', "\\|").replace('\n', " ");
        lines.push(format!(
            "| `{}` | `{}` | `{:.4}` | `{}` | `{}` | {} |",
            row.candidate_id, row.approved, row.score, row.signature, row.location, excerpt
        ));
    }

    if !report.guardrail_violations.is_empty() {
        lines.push(String::new());
        lines.push("## Guardrail violations".to_string());
        for v in &report.guardrail_violations {
            lines.push(format!("- {v}"));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DecisionBasis, ReasonTag, Score};
    use tempfile::TempDir;

    fn decision(id: &str, suggestion: Suggestion) -> Decision {
        Decision {
            candidate_id: id.to_string(),
            score: Score {
                candidate_id: id.to_string(),
                score: 0.9,
                suggested_is_heading: suggestion,
                suggested_level: 2,
                reason: ReasonTag::Title,
                confidence: 0.9,
                must_not_match: false,
                rationale: vec![],
            },
            basis: DecisionBasis::Rule,
            oracle: None,
            oracle_error: false,
        }
    }

    fn gold(id: &str, is_heading: bool) -> GoldRow {
        GoldRow {
            candidate_id: id.to_string(),
            gold: GoldLabel { is_heading },
        }
    }

    fn summary() -> ProposalSummary {
        ProposalSummary {
            candidate_count: 4,
            proposed_count: 2,
            blocked_count: 1,
            ambiguous_count: 1,
            oracle_error_count: 0,
            counts_by_kind: BTreeMap::new(),
            score_bands: BTreeMap::new(),
            anchors_before: 0,
            anchors_after: 2,
            anchor_miss_before: 4,
            anchor_miss_after_estimate: 2,
            anchor_miss_relative_reduction_estimate: 0.5,
            top_ambiguous: vec![],
        }
    }

    #[test]
    fn fp_counts_negatives_predicted_positive() {
        let decisions = vec![
            decision("a", Suggestion::True),
            decision("b", Suggestion::False),
        ];
        let rows = vec![gold("a", false), gold("b", false), gold("c", true)];
        let fp = split_fp("train", &rows, &decisions);
        assert_eq!(fp.negative_total, 2);
        assert_eq!(fp.false_positives, 1);
        assert!((fp.fp_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn holdout_regression_fails_the_report() {
        let decisions = vec![decision("h1", Suggestion::True)];
        let train = vec![gold("t1", false)];
        let holdout = vec![gold("h1", false)];
        let report = build_report(
            "run-1",
            "b1",
            summary(),
            &decisions,
            &[],
            &[],
            &train,
            &holdout,
            0.0,
        );
        assert!(report.holdout_regression);
        assert_eq!(report.status, "failed");
        assert!(!report.guardrail_violations.is_empty());
    }

    #[test]
    fn reduction_below_configured_minimum_fails_the_report() {
        // Summary achieves 0.5; a configured floor of 0.8 must fail it.
        let report = build_report("run-1", "b1", summary(), &[], &[], &[], &[], &[], 0.8);
        assert_eq!(report.status, "failed");
        assert!(report
            .guardrail_violations
            .iter()
            .any(|v| v.contains("below minimum 0.8000")));

        let relaxed = build_report("run-1", "b1", summary(), &[], &[], &[], &[], &[], 0.3);
        assert_eq!(relaxed.status, "passed");
    }

    #[test]
    fn rows_carry_the_candidate_signature() {
        use crate::models::{DecisionBasis, ProposedInjection};
        let proposed = vec![
            ProposedInjection {
                candidate_id: "a".into(),
                signature: "sig-a".into(),
                file: "001.html".into(),
                file_index: 0,
                insertion_offset: 10,
                level: 2,
                title_text: "باب الإدغام".into(),
                decision_basis: DecisionBasis::Rule,
                score: 0.9,
                oracle_result: None,
                blocked_by_must_not_heading: false,
                review_required: true,
            },
            ProposedInjection {
                candidate_id: "b".into(),
                signature: "sig-b".into(),
                file: "001.html".into(),
                file_index: 0,
                insertion_offset: 40,
                level: 2,
                title_text: "مسألة:".into(),
                decision_basis: DecisionBasis::Rule,
                score: 0.0,
                oracle_result: None,
                blocked_by_must_not_heading: true,
                review_required: true,
            },
        ];
        let report = build_report("run-1", "b1", summary(), &[], &proposed, &[], &[], &[], 0.0);
        assert_eq!(report.traceability.len(), 1);
        assert_eq!(report.traceability[0].signature, "sig-a");
        assert_eq!(report.must_not_violations.len(), 1);
        assert_eq!(report.must_not_violations[0].signature, "sig-b");

        let md = render_markdown(&report);
        assert!(md.contains("`sig-a`"));
        assert!(md.contains("`sig-b`"));
    }

    #[test]
    fn clean_report_passes_and_writes_both_formats() {
        let report = build_report("run-1", "b1", summary(), &[], &[], &[], &[], &[], 0.0);
        assert_eq!(report.status, "passed");

        let tmp = TempDir::new().unwrap();
        write_report(tmp.path(), &report).unwrap();
        assert!(tmp.path().join("run_report.json").exists());
        let md = std::fs::read_to_string(tmp.path().join("run_report.md")).unwrap();
        assert!(md.contains("Status: **PASSED**"));
        assert!(md.contains("relative reduction: `0.5000`"));
    }

    #[test]
    fn report_is_deterministic() {
        let build = || {
            serde_json::to_string(&build_report(
                "run-1",
                "b1",
                summary(),
                &[],
                &[],
                &[],
                &[],
                &[],
                0.0,
            ))
            .unwrap()
        };
        assert_eq!(build(), build());
    }
}
