//! Staged pipeline commands: ingest → approve-headings → apply →
//! approve-plan → commit.
//!
//! Each stage reads the frozen artifacts of the previous one instead of
//! recomputing decisions, so the artifact set under `runs/<run_id>/<book_id>/`
//! is the single record of what happened. Stages are deterministic: a rerun
//! with a pinned run id over unchanged inputs reproduces byte-identical
//! artifacts (the oracle cache guarantees Layer C answers don't change).

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::approval;
use crate::artifacts;
use crate::candidates::{self, CandidateSeed};
use crate::config::{ai_profile_from_env, Config};
use crate::dom;
use crate::error::PipelineError;
use crate::inject;
use crate::manifest;
use crate::models::{
    ApprovedInjection, BookMeta, Candidate, ChunkRecord, Decision, ProposedInjection, RunState,
    Suggestion,
};
use crate::oracle::OracleVerifier;
use crate::placement::{self, ChunkPlan, ChunkPlanItem};
use crate::plan::{self, OracleOutcomeRecord, STRICT_ANCHOR_PATTERN};
use crate::project;
use crate::registry::Registry;
use crate::report;
use crate::scoring;

pub struct RunPaths {
    pub run_book_dir: PathBuf,
}

impl RunPaths {
    pub fn new(cfg: &Config, run_id: &str, book_id: &str) -> Self {
        Self {
            run_book_dir: cfg.paths.runs_root.join(run_id).join(book_id),
        }
    }

    fn artifact(&self, name: &str) -> PathBuf {
        self.run_book_dir.join(name)
    }
}

fn read_book_meta(cfg: &Config, book_id: &str) -> Result<BookMeta> {
    let path = cfg.paths.books_root.join(book_id).join("meta.json");
    if !path.exists() {
        return Err(PipelineError::Input {
            path,
            reason: "meta.json is required (science, title, author)".into(),
        }
        .into());
    }
    artifacts::read_json(&path)
}

fn corpus_science_root(cfg: &Config, meta: &BookMeta) -> PathBuf {
    cfg.paths.corpus_root.join(meta.science.to_string())
}

// ---------------------------------------------------------------------------
// ingest: manifest through proposal
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub async fn run_ingest(
    cfg: &Config,
    book_id: &str,
    run_id_override: Option<&str>,
    clean_book: bool,
    dry_run: bool,
    override_must_not: bool,
) -> Result<String> {
    let meta = read_book_meta(cfg, book_id)?;

    if clean_book {
        let moved = project::archive_book_outputs(
            &cfg.paths.runs_root,
            &corpus_science_root(cfg, &meta),
            book_id,
        )?;
        println!("clean-book {book_id}: archived {moved} output directories");
    }

    // Manifest and run identity.
    let (sources, ingest_manifest) = manifest::load_book(&cfg.paths.books_root, book_id)?;
    let digest = manifest::manifest_digest(&sources);
    let run_id = manifest::make_run_id(run_id_override, &digest);
    let paths = RunPaths::new(cfg, &run_id, book_id);

    // A rerun into the same run directory must see identical frozen inputs.
    let manifest_path = paths.artifact("ingest_manifest.json");
    if manifest_path.exists() {
        let prior: manifest::IngestManifest = artifacts::read_json(&manifest_path)?;
        manifest::verify_manifest_unchanged(&prior, &ingest_manifest)?;
    }
    artifacts::write_json(&manifest_path, &ingest_manifest)?;

    // DOM normalization and the book profile.
    let (files, profile) = dom::normalize_book(&sources)?;
    artifacts::write_json(&paths.artifact("book_profile.json"), &profile)?;

    // Layer A candidates.
    let seeds = candidates::generate_candidates(book_id, &files);
    let candidate_rows: Vec<&Candidate> = seeds.iter().map(|s| &s.candidate).collect();
    artifacts::write_jsonl(&paths.artifact("heading_candidates.jsonl"), &candidate_rows)?;

    // Layer B deterministic scoring.
    let must_not = scoring::load_must_not(&cfg.paths.fixtures_root.join("must_not_heading.jsonl"))?;
    let scores = scoring::score_book(&seeds, &profile, &must_not, &cfg.scoring);

    // Layer C advisory verification for the ambiguous slice.
    let oracle_outcomes = if cfg.oracle.enabled && !dry_run {
        consult_oracle(cfg, &seeds, &scores).await?
    } else {
        BTreeMap::new()
    };

    // Merged decisions, proposal, summary.
    let decisions = plan::merge_decisions(&scores, &oracle_outcomes);
    artifacts::write_jsonl(&paths.artifact("heading_decisions.jsonl"), &decisions)?;

    // Fail-closed routing: anomalies land in _REVIEW/ with their evidence.
    route_anomalies_to_review(cfg, &meta, book_id, &seeds, &decisions)?;

    let proposals = plan::build_proposal(&seeds, &decisions, override_must_not);
    artifacts::write_jsonl(
        &paths.artifact("heading_injections.proposed.jsonl"),
        &proposals,
    )?;

    let summary = plan::summarize(&seeds, &decisions, &proposals, &files);
    let train = report::load_gold_split(&cfg.paths.fixtures_root.join("splits").join("train.jsonl"))?;
    let holdout =
        report::load_gold_split(&cfg.paths.fixtures_root.join("splits").join("holdout.jsonl"))?;
    let run_report = report::build_report(
        &run_id,
        book_id,
        summary.clone(),
        &decisions,
        &proposals,
        &[],
        &train,
        &holdout,
        cfg.report.minimum_relative_reduction,
    );
    report::write_report(&paths.run_book_dir, &run_report)?;

    approval::write_state(
        &paths.run_book_dir,
        RunState::AwaitingApproval,
        serde_json::json!({
            "book_id": book_id,
            "run_id": run_id,
            "science": meta.science.to_string(),
            "candidates": summary.candidate_count,
            "proposed": summary.proposed_count,
            "blocked": summary.blocked_count,
        }),
    )?;

    println!("ingest {book_id}");
    println!("  run_id: {run_id}");
    println!("  files: {}", ingest_manifest.file_count);
    println!("  candidates: {}", summary.candidate_count);
    println!("  proposed injections: {}", summary.proposed_count);
    println!("  blocked by must-not-heading: {}", summary.blocked_count);
    println!("  ambiguous: {}", summary.ambiguous_count);
    if dry_run {
        println!("  oracle: disabled (--dry-run)");
    }
    println!("awaiting approval");

    Ok(run_id)
}

/// Decision-affecting anomalies (conflicting features, oracle failures) are
/// never fatal; they surface as `_REVIEW/` entries carrying the evidence a
/// reviewer needs: signature, excerpt, score, and the oracle reply if any.
fn route_anomalies_to_review(
    cfg: &Config,
    meta: &BookMeta,
    book_id: &str,
    seeds: &[CandidateSeed],
    decisions: &[Decision],
) -> Result<()> {
    let by_id: BTreeMap<&str, &CandidateSeed> = seeds
        .iter()
        .map(|s| (s.candidate.candidate_id.as_str(), s))
        .collect();
    let zone_root = corpus_science_root(cfg, meta);

    for decision in decisions {
        let anomalous = decision.oracle_error
            || decision
                .score
                .rationale
                .iter()
                .any(|r| r == "conflicting_features");
        if !anomalous {
            continue;
        }
        let Some(seed) = by_id.get(decision.candidate_id.as_str()) else {
            continue;
        };
        let cand = &seed.candidate;
        let evidence = serde_json::json!({
            "candidate_id": cand.candidate_id,
            "text": cand.text,
            "signature": cand.signature,
            "html_excerpt": cand.html_excerpt,
            "dom_path": cand.dom_path,
            "file": cand.file,
            "score": decision.score.score,
            "rationale": decision.score.rationale,
            "oracle": decision.oracle,
            "oracle_error": decision.oracle_error,
        });
        let name = format!("candidate_{}", &cand.candidate_id[..16]);
        project::write_review_entry(&zone_root, book_id, &name, &evidence)?;
    }
    Ok(())
}

/// Consult the oracle for Unknown, non-blocked candidates, within the
/// profile budget. Outcomes are keyed by candidate id and merged back into
/// canonical order by the plan builder.
async fn consult_oracle(
    cfg: &Config,
    seeds: &[CandidateSeed],
    scores: &[crate::models::Score],
) -> Result<BTreeMap<String, OracleOutcomeRecord>> {
    let profile = ai_profile_from_env()?;
    let budget = cfg.oracle.effective_budget(profile);
    let cache_path = cfg.paths.cache_dir.join("oracle_cache.json");
    let mut verifier = OracleVerifier::new(&cfg.oracle, cache_path, false)?;

    let by_id: BTreeMap<&str, &CandidateSeed> = seeds
        .iter()
        .map(|s| (s.candidate.candidate_id.as_str(), s))
        .collect();

    let mut outcomes = BTreeMap::new();
    let mut consulted = 0usize;
    for score in scores {
        if score.suggested_is_heading != Suggestion::Unknown || score.must_not_match {
            continue;
        }
        if consulted >= budget {
            tracing::info!(budget, "oracle budget exhausted; remaining ambiguous candidates stay unknown");
            break;
        }
        let Some(seed) = by_id.get(score.candidate_id.as_str()) else {
            continue;
        };
        consulted += 1;
        match verifier.verify(&seed.candidate).await {
            Ok(Some(outcome)) => {
                outcomes.insert(
                    score.candidate_id.clone(),
                    OracleOutcomeRecord {
                        verdict: Some(outcome.verdict),
                        from_cache: outcome.from_cache,
                        error: false,
                    },
                );
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(candidate_id = %score.candidate_id, error = %err, "oracle failed; candidate stays unknown");
                outcomes.insert(
                    score.candidate_id.clone(),
                    OracleOutcomeRecord {
                        verdict: None,
                        from_cache: false,
                        error: true,
                    },
                );
            }
        }
    }
    Ok(outcomes)
}

// ---------------------------------------------------------------------------
// approve-headings: first gate
// ---------------------------------------------------------------------------

pub fn run_approve_headings(
    cfg: &Config,
    run_id: &str,
    book_id: &str,
    approval_file: Option<&Path>,
    approve_all: bool,
    reject_all: bool,
    reviewer: &str,
) -> Result<()> {
    let paths = RunPaths::new(cfg, run_id, book_id);
    let proposed: Vec<ProposedInjection> =
        artifacts::read_jsonl(&paths.artifact("heading_injections.proposed.jsonl"))
            .context("no proposal found; run `ibp ingest` first")?;

    let approved: Vec<ApprovedInjection> = if let Some(path) = approval_file {
        artifacts::read_jsonl(path)?
    } else if approve_all || reject_all {
        approval::bulk_decide(&proposed, approve_all, reviewer)
    } else {
        return Err(PipelineError::ApprovalMismatch(
            "provide --approval-file, --approve-all, or --reject-all".into(),
        )
        .into());
    };

    approval::validate_approval(&proposed, &approved)?;
    artifacts::write_jsonl(
        &paths.artifact("heading_injections.approved.jsonl"),
        &approved,
    )?;

    approval::transition(
        &paths.run_book_dir,
        &[RunState::AwaitingApproval],
        RunState::Approved,
        serde_json::json!({
            "approved": approved.len(),
            "proposed": proposed.len(),
            "reviewer": reviewer,
        }),
    )?;

    println!("approve-headings {run_id}");
    println!("  approved: {} of {} proposed", approved.len(), proposed.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// apply: injection, splitting, placement; emits the second-gate plan
// ---------------------------------------------------------------------------

pub async fn run_apply(cfg: &Config, run_id: &str, book_id: &str) -> Result<()> {
    let meta = read_book_meta(cfg, book_id)?;
    let paths = RunPaths::new(cfg, run_id, book_id);

    let state = approval::read_state(&paths.run_book_dir)?;
    if state.state < RunState::Approved {
        return Err(PipelineError::AwaitingApproval(run_id.to_string()).into());
    }

    // Frozen inputs must still match the manifest.
    let (sources, current_manifest) = manifest::load_book(&cfg.paths.books_root, book_id)?;
    let prior: manifest::IngestManifest = artifacts::read_json(&paths.artifact("ingest_manifest.json"))?;
    manifest::verify_manifest_unchanged(&prior, &current_manifest)?;

    let (files, _profile) = dom::normalize_book(&sources)?;
    let candidates: Vec<Candidate> =
        artifacts::read_jsonl(&paths.artifact("heading_candidates.jsonl"))?;
    let decisions: Vec<Decision> =
        artifacts::read_jsonl(&paths.artifact("heading_decisions.jsonl"))?;
    let approved: Vec<ApprovedInjection> =
        artifacts::read_jsonl(&paths.artifact("heading_injections.approved.jsonl"))
            .context("no approval found; run `ibp approve-headings` first")?;

    // Inject and split.
    let outcome = inject::apply_and_split(book_id, &files, &approved, &candidates)?;
    for (file, markup) in &outcome.derived {
        artifacts::write_atomic(
            &paths.run_book_dir.join("derived").join(format!("{file}.md")),
            markup.as_bytes(),
        )?;
    }
    project::write_anchor_miss(&corpus_science_root(cfg, &meta), book_id, &outcome.anchor_miss)?;

    // Placement proposals against the current registry.
    let registry =
        Registry::open(&corpus_science_root(cfg, &meta).join("registry")).await?;
    let topics = registry.topics_for_matching().await?;
    registry.close().await;

    let decision_by_path: BTreeMap<(String, String), &Decision> = candidates
        .iter()
        .filter_map(|c| {
            decisions
                .iter()
                .find(|d| d.candidate_id == c.candidate_id)
                .map(|d| ((c.file.clone(), c.dom_path.clone()), d))
        })
        .collect();

    let items: Vec<ChunkPlanItem> = outcome
        .chunks
        .iter()
        .map(|chunk| {
            let decision = decision_by_path
                .get(&(chunk.provenance.file.clone(), chunk.provenance.dom_anchor.clone()))
                .copied();
            let boundary = placement::boundary_confidence(decision);
            let proposal = placement::propose_placement(chunk, boundary, &topics, &cfg.placement);
            ChunkPlanItem {
                chunk_id: chunk.chunk_id.clone(),
                file: chunk.provenance.file.clone(),
                heading: chunk.heading.clone(),
                level: chunk.level,
                start_offset: chunk.provenance.start_offset,
                end_offset: chunk.provenance.end_offset,
                review_required: true,
                placement: proposal,
            }
        })
        .collect();

    let chunk_plan = ChunkPlan {
        book_id: book_id.to_string(),
        run_id: run_id.to_string(),
        strict_anchor_policy: STRICT_ANCHOR_PATTERN.to_string(),
        status: "proposed".to_string(),
        approval_required: true,
        items,
        approved_by: None,
        approved_at: None,
    };
    artifacts::write_json(&paths.artifact("chunk_plan.proposed.json"), &chunk_plan)?;
    artifacts::write_atomic(
        &paths.artifact("chunk_plan.proposed.md"),
        chunk_plan_markdown(&chunk_plan, &outcome).as_bytes(),
    )?;

    // Refresh the report with approval traceability.
    let proposed: Vec<ProposedInjection> =
        artifacts::read_jsonl(&paths.artifact("heading_injections.proposed.jsonl"))?;
    let seeds_for_summary = rebuild_seeds(&candidates);
    let summary = plan::summarize(&seeds_for_summary, &decisions, &proposed, &files);
    let train = report::load_gold_split(&cfg.paths.fixtures_root.join("splits").join("train.jsonl"))?;
    let holdout =
        report::load_gold_split(&cfg.paths.fixtures_root.join("splits").join("holdout.jsonl"))?;
    let run_report = report::build_report(
        run_id,
        book_id,
        summary,
        &decisions,
        &proposed,
        &approved,
        &train,
        &holdout,
        cfg.report.minimum_relative_reduction,
    );
    report::write_report(&paths.run_book_dir, &run_report)?;

    approval::transition(
        &paths.run_book_dir,
        &[RunState::Approved, RunState::PlanAwaitingApproval],
        RunState::PlanAwaitingApproval,
        serde_json::json!({
            "chunks": chunk_plan.items.len(),
            "anchor_miss_files": outcome.anchor_miss.len(),
            "duplicate_anchors_dropped": outcome.duplicate_anchors_dropped,
        }),
    )?;

    println!("apply {run_id}");
    println!("  chunks planned: {}", chunk_plan.items.len());
    println!("  anchor-miss files: {}", outcome.anchor_miss.len());
    if outcome.duplicate_anchors_dropped > 0 {
        println!(
            "  duplicate anchors dropped: {}",
            outcome.duplicate_anchors_dropped
        );
    }
    println!("awaiting plan approval");
    Ok(())
}

/// Summarize needs seeds; at apply time features no longer matter, so
/// candidates are wrapped with neutral features.
fn rebuild_seeds(candidates: &[Candidate]) -> Vec<CandidateSeed> {
    candidates
        .iter()
        .map(|c| CandidateSeed {
            candidate: c.clone(),
            features: crate::candidates::StructuralFeatures {
                isolated: false,
                centered: false,
                bold: false,
                font_larger: false,
                title_class: false,
                preceded_by_hr: false,
                in_metadata_zone: false,
                in_footnote_zone: false,
                is_pagehead: false,
                repetition_key: c.signature.clone(),
            },
        })
        .collect()
}

fn chunk_plan_markdown(plan: &ChunkPlan, outcome: &inject::SplitOutcome) -> String {
    let mut lines = vec![
        format!("# Chunk Plan (Proposed) — {}", plan.book_id),
        String::new(),
        "- Status: **PROPOSED** (no canonical writes performed)".to_string(),
        "- Approval gate: **required**".to_string(),
        format!("- Strict anchor policy: `{}`", plan.strict_anchor_policy),
        format!("- Chunks: **{}**", plan.items.len()),
        format!("- Anchor-miss files: **{}**", outcome.anchor_miss.len()),
        String::new(),
        "## Proposed chunks".to_string(),
    ];
    if plan.items.is_empty() {
        lines.push("- No eligible anchors found under the strict policy.".to_string());
    }
    for item in &plan.items {
        let placement = match (&item.placement.chosen_topic_id, &item.placement.proposed_new_topic_title) {
            (Some(id), _) => format!("→ {id}"),
            (None, Some(title)) => format!("→ new topic: {title}"),
            (None, None) => "→ unplaced".to_string(),
        };
        lines.push(format!(
            "- `{}` | H{} | {} | {} | {}",
            &item.chunk_id[..16],
            item.level,
            item.file,
            item.heading,
            placement
        ));
    }
    lines.push(String::new());
    lines.push("Approval is required before the commit stage.".to_string());
    lines.push(String::new());
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// approve-plan: second gate
// ---------------------------------------------------------------------------

pub fn run_approve_plan(
    cfg: &Config,
    run_id: &str,
    book_id: &str,
    approval_file: Option<&Path>,
    approve_all: bool,
    reject_all: bool,
    reviewer: &str,
) -> Result<()> {
    let paths = RunPaths::new(cfg, run_id, book_id);
    let proposed: ChunkPlan = artifacts::read_json(&paths.artifact("chunk_plan.proposed.json"))
        .context("no chunk plan found; run `ibp apply` first")?;

    let mut approved: ChunkPlan = if let Some(path) = approval_file {
        artifacts::read_json(path)?
    } else if approve_all || reject_all {
        ChunkPlan {
            items: if approve_all {
                proposed.items.clone()
            } else {
                Vec::new()
            },
            ..proposed.clone()
        }
    } else {
        return Err(PipelineError::ApprovalMismatch(
            "provide --approval-file, --approve-all, or --reject-all".into(),
        )
        .into());
    };

    approval::validate_plan_approval(&proposed, &approved)?;
    approved.status = "approved".to_string();
    approved.approval_required = false;
    approved.approved_by = Some(reviewer.to_string());
    approved.approved_at = Some(chrono::Utc::now().to_rfc3339());
    artifacts::write_json(&paths.artifact("chunk_plan.approved.json"), &approved)?;

    approval::transition(
        &paths.run_book_dir,
        &[RunState::PlanAwaitingApproval],
        RunState::PlanApproved,
        serde_json::json!({
            "approved_chunks": approved.items.len(),
            "proposed_chunks": proposed.items.len(),
            "reviewer": reviewer,
        }),
    )?;

    println!("approve-plan {run_id}");
    println!(
        "  approved: {} of {} chunks",
        approved.items.len(),
        proposed.items.len()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// commit: registry and projection
// ---------------------------------------------------------------------------

pub async fn run_commit(cfg: &Config, run_id: &str, book_id: &str) -> Result<()> {
    let meta = read_book_meta(cfg, book_id)?;
    let paths = RunPaths::new(cfg, run_id, book_id);

    let state = approval::read_state(&paths.run_book_dir)?;
    if state.state < RunState::PlanApproved {
        return Err(PipelineError::AwaitingApproval(run_id.to_string()).into());
    }

    let chunk_plan: ChunkPlan = artifacts::read_json(&paths.artifact("chunk_plan.approved.json"))
        .context("no approved chunk plan; run `ibp approve-plan` first")?;
    if chunk_plan.approval_required {
        return Err(PipelineError::AwaitingApproval(run_id.to_string()).into());
    }

    let run_report: report::RunReport = artifacts::read_json(&paths.artifact("run_report.json"))?;
    if run_report.status == "failed" {
        return Err(PipelineError::InvariantViolation(format!(
            "run report failed guardrails: {}",
            run_report.guardrail_violations.join(" | ")
        ))
        .into());
    }

    // Rebuild chunks deterministically from the frozen artifacts, then keep
    // only the approved subset.
    let (sources, current_manifest) = manifest::load_book(&cfg.paths.books_root, book_id)?;
    let prior: manifest::IngestManifest =
        artifacts::read_json(&paths.artifact("ingest_manifest.json"))?;
    manifest::verify_manifest_unchanged(&prior, &current_manifest)?;
    let (files, _) = dom::normalize_book(&sources)?;
    let candidates: Vec<Candidate> =
        artifacts::read_jsonl(&paths.artifact("heading_candidates.jsonl"))?;
    let approved: Vec<ApprovedInjection> =
        artifacts::read_jsonl(&paths.artifact("heading_injections.approved.jsonl"))?;
    let outcome = inject::apply_and_split(book_id, &files, &approved, &candidates)?;

    let by_id: BTreeMap<&str, &ChunkRecord> = outcome
        .chunks
        .iter()
        .map(|c| (c.chunk_id.as_str(), c))
        .collect();

    let science_root = corpus_science_root(cfg, &meta);
    let chunks_dir = science_root.join("chunks_by_book").join(book_id);
    let topics_root = science_root.join("topics");

    // Canonical files first (write-once), then the registry transaction,
    // then the projection pass.
    let mut commit_items = Vec::with_capacity(chunk_plan.items.len());
    let mut canonical_written = 0usize;
    for item in &chunk_plan.items {
        let chunk = by_id.get(item.chunk_id.as_str()).ok_or_else(|| {
            PipelineError::InvariantViolation(format!(
                "approved chunk {} cannot be reproduced from the run artifacts",
                item.chunk_id
            ))
        })?;
        let (canonical_path, created) = project::write_canonical(&chunks_dir, chunk)?;
        if created {
            canonical_written += 1;
        }
        commit_items.push((
            (*chunk).clone(),
            item.placement.clone(),
            canonical_path.to_string_lossy().into_owned(),
        ));
    }

    let registry = Registry::open(&science_root.join("registry")).await?;
    registry
        .upsert_book(
            book_id,
            meta.science,
            &meta.title,
            meta.author.as_deref(),
            run_id,
        )
        .await?;
    let (stats, assignments) = registry.commit_plan(run_id, &commit_items).await?;

    let mut projection_rows = Vec::with_capacity(assignments.len());
    for ((chunk, _, canonical_path), (chunk_id, topic_id)) in
        commit_items.iter().zip(assignments.iter())
    {
        debug_assert_eq!(&chunk.chunk_id, chunk_id);
        let title = registry.topic_title(topic_id).await?;
        let topic_dir = topics_root.join(project::topic_folder_name(topic_id, &title));
        let file_name = format!("chunk_{}.md", chunk.chunk_id);
        let (projected, link_type) =
            project::project_chunk(Path::new(canonical_path), &topic_dir, &file_name)?;
        projection_rows.push(crate::models::ProjectionRow {
            topic_id: topic_id.clone(),
            chunk_id: chunk_id.clone(),
            canonical_path: canonical_path.clone(),
            projected_path: projected.to_string_lossy().into_owned(),
            link_type,
        });
    }
    registry.record_projections(run_id, &projection_rows).await?;
    registry
        .export_topics(&science_root.join("registry"))
        .await?;
    registry.close().await;

    approval::transition(
        &paths.run_book_dir,
        &[RunState::PlanApproved, RunState::Committed],
        RunState::Committed,
        serde_json::json!({
            "chunks_inserted": stats.chunks_inserted,
            "chunks_already_present": stats.chunks_already_present,
            "topics_created": stats.topics_created,
            "projections": projection_rows.len(),
        }),
    )?;

    println!("commit {run_id}");
    println!("  canonical chunks written: {canonical_written}");
    println!("  registry inserts: {}", stats.chunks_inserted);
    println!("  already present: {}", stats.chunks_already_present);
    println!("  topics created: {}", stats.topics_created);
    println!("  projections: {}", projection_rows.len());
    println!("ok");
    Ok(())
}

// ---------------------------------------------------------------------------
// clean-book
// ---------------------------------------------------------------------------

pub fn run_clean_book(cfg: &Config, book_id: &str) -> Result<()> {
    let meta = read_book_meta(cfg, book_id)?;
    let moved = project::archive_book_outputs(
        &cfg.paths.runs_root,
        &corpus_science_root(cfg, &meta),
        book_id,
    )?;
    println!("clean-book {book_id}: archived {moved} output directories");
    Ok(())
}
