//! Injector and strict-anchor splitter.
//!
//! Injection is purely additive: each approved injection inserts one new
//! heading line (`##`/`###` + space + title) into the derived plain markup at
//! its insertion offset. Existing text is never modified. Insertion points
//! are addressed by pre-injection offsets, which injection never shifts, so
//! every approved offset stays valid no matter how many lines land before it.
//!
//! Splitting is strict: a line matching `^#{2,6}\s+` starts a chunk, nothing
//! else does. Chunks never cross files. The region before the first anchor
//! of a file becomes an `_ANCHOR_MISS` diagnostic (with the candidate
//! snippets that were present but not injected) and produces zero canonical
//! chunks. Footnote content whose position falls inside a chunk's span is
//! attached to that chunk's trailing footnotes section.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dom::NormalizedFile;
use crate::error::PipelineError;
use crate::models::{ApprovedInjection, Candidate, ChunkRecord, ChunkStatus, Provenance};
use crate::plan::anchor_re;

/// Heading of the synthetic footnotes sub-section appended to chunk bodies.
pub const FOOTNOTES_HEADING: &str = "## FOOTNOTES";

/// Diagnostics for a pre-anchor (or anchor-free) file region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorMissDiagnostic {
    pub file: String,
    pub line_count: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    /// Candidate snippets present in the region but not injected.
    pub candidate_snippets: Vec<String>,
    /// First lines of the region, for the reviewer.
    pub preview: Vec<String>,
}

/// Everything the apply stage produced for one book.
#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub chunks: Vec<ChunkRecord>,
    pub anchor_miss: Vec<AnchorMissDiagnostic>,
    pub duplicate_anchors_dropped: usize,
    /// Injected derived markup per file, in file order.
    pub derived: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct Line {
    text: String,
    dom_path: String,
    page: Option<u32>,
    /// Offset in the pre-injection markup; `None` for injected headings.
    original_offset: Option<usize>,
}

const MISS_PREVIEW_LINES: usize = 5;

/// Deterministic chunk identity:
/// sha256(book_id ‖ file ‖ dom_anchor ‖ start_offset ‖ end_offset), hex.
pub fn chunk_id(
    book_id: &str,
    file: &str,
    dom_anchor: &str,
    start_offset: usize,
    end_offset: usize,
) -> String {
    let mut hasher = Sha256::new();
    for part in [
        book_id,
        file,
        dom_anchor,
        &start_offset.to_string(),
        &end_offset.to_string(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Apply approved injections and split every file on strict anchors.
pub fn apply_and_split(
    book_id: &str,
    files: &[NormalizedFile],
    approved: &[ApprovedInjection],
    candidates: &[Candidate],
) -> Result<SplitOutcome> {
    let mut chunks = Vec::new();
    let mut anchor_miss = Vec::new();
    let mut duplicates = 0usize;
    let mut derived = Vec::new();

    let dom_path_by_candidate: std::collections::BTreeMap<&str, &str> = candidates
        .iter()
        .map(|c| (c.candidate_id.as_str(), c.dom_path.as_str()))
        .collect();

    for file in files {
        let mut file_injections: Vec<&ApprovedInjection> = approved
            .iter()
            .filter(|a| a.file_index == file.file_index)
            .collect();
        // Insertion positions are located by source offsets, which injection
        // never shifts, so earlier offsets stay valid throughout; ascending
        // order keeps equal-offset injections in artifact order.
        file_injections.sort_by_key(|a| a.insertion_offset);

        let (lines, dropped) = build_injected_lines(file, &file_injections, &dom_path_by_candidate)?;
        duplicates += dropped;

        let markup: String = lines.iter().map(|l| format!("{}\n", l.text)).collect();
        derived.push((file.file.clone(), markup.clone()));

        let (file_chunks, miss) = split_lines(book_id, file, &lines, candidates);
        verify_chunk_bodies(&file_chunks, &markup)?;
        chunks.extend(file_chunks);
        if let Some(m) = miss {
            anchor_miss.push(m);
        }
    }

    Ok(SplitOutcome {
        chunks,
        anchor_miss,
        duplicate_anchors_dropped: duplicates,
        derived,
    })
}

/// Materialize the file's line list with injected heading lines. Duplicate
/// injections (same offset, identical heading line) keep the first and drop
/// the rest, logged.
fn build_injected_lines(
    file: &NormalizedFile,
    injections: &[&ApprovedInjection],
    dom_path_by_candidate: &std::collections::BTreeMap<&str, &str>,
) -> Result<(Vec<Line>, usize)> {
    let mut lines: Vec<Line> = file
        .blocks
        .iter()
        .filter(|b| b.in_markup)
        .map(|b| Line {
            text: b.text.clone(),
            dom_path: b.dom_path.clone(),
            page: b.page_index,
            original_offset: Some(b.derived_offset),
        })
        .collect();

    let mut dropped = 0usize;
    let mut seen: Vec<(usize, String)> = Vec::new();

    for injection in injections {
        let heading_line = format!(
            "{} {}",
            "#".repeat(injection.level as usize),
            injection.effective_title()
        );
        if !anchor_re().is_match(&heading_line) {
            return Err(PipelineError::InvariantViolation(format!(
                "injected line for candidate {} is not a strict anchor",
                injection.candidate_id
            ))
            .into());
        }

        let key = (injection.insertion_offset, heading_line.clone());
        if seen.contains(&key) {
            tracing::warn!(
                candidate_id = %injection.candidate_id,
                offset = injection.insertion_offset,
                "duplicate anchor at identical offset dropped"
            );
            dropped += 1;
            continue;
        }
        seen.push(key);

        let position = lines
            .iter()
            .position(|l| {
                l.original_offset
                    .map(|o| o >= injection.insertion_offset)
                    .unwrap_or(false)
            })
            .unwrap_or(lines.len());
        // The candidate's dom_path anchors the chunk identity.
        let dom_path = dom_path_by_candidate
            .get(injection.candidate_id.as_str())
            .map(|p| p.to_string())
            .unwrap_or_else(|| fallback_dom_path(file, injection));
        lines.insert(
            position,
            Line {
                text: heading_line,
                dom_path,
                page: lines.get(position).and_then(|l| l.page),
                original_offset: None,
            },
        );
    }

    Ok((lines, dropped))
}

fn fallback_dom_path(file: &NormalizedFile, injection: &ApprovedInjection) -> String {
    file.blocks
        .iter()
        .find(|b| b.in_markup && b.derived_offset == injection.insertion_offset)
        .map(|b| b.dom_path.clone())
        .unwrap_or_else(|| format!("/injected[{}]", injection.insertion_offset))
}

/// Split one file's line list on strict anchors.
fn split_lines(
    book_id: &str,
    file: &NormalizedFile,
    lines: &[Line],
    candidates: &[Candidate],
) -> (Vec<ChunkRecord>, Option<AnchorMissDiagnostic>) {
    // Offsets over the injected markup.
    let mut offsets = Vec::with_capacity(lines.len() + 1);
    let mut cursor = 0usize;
    for line in lines {
        offsets.push(cursor);
        cursor += line.text.len() + 1;
    }
    offsets.push(cursor);

    let anchor_indices: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| anchor_re().is_match(&l.text))
        .map(|(i, _)| i)
        .collect();

    // Pre-anchor region (or the whole file when no anchor exists).
    let miss_end = anchor_indices.first().copied().unwrap_or(lines.len());
    let miss = if miss_end > 0 || anchor_indices.is_empty() {
        let region_end_offset = offsets[miss_end];
        let snippets: Vec<String> = candidates
            .iter()
            .filter(|c| c.file_index == file.file_index && c.start_offset < region_end_offset.max(1))
            .map(|c| c.text.clone())
            .take(20)
            .collect();
        Some(AnchorMissDiagnostic {
            file: file.file.clone(),
            line_count: miss_end,
            start_offset: 0,
            end_offset: region_end_offset,
            candidate_snippets: snippets,
            preview: lines[..miss_end]
                .iter()
                .take(MISS_PREVIEW_LINES)
                .map(|l| l.text.clone())
                .collect(),
        })
    } else {
        None
    };

    let mut chunks = Vec::new();
    for (i, &anchor_idx) in anchor_indices.iter().enumerate() {
        let end_idx = anchor_indices
            .get(i + 1)
            .copied()
            .unwrap_or(lines.len());
        let start_offset = offsets[anchor_idx];
        let end_offset = offsets[end_idx];

        let anchor = &lines[anchor_idx];
        let (marks, title) = anchor
            .text
            .split_once(' ')
            .unwrap_or((anchor.text.as_str(), ""));
        let level = marks.len() as u8;

        let body: String = lines[anchor_idx..end_idx]
            .iter()
            .map(|l| format!("{}\n", l.text))
            .collect();

        // Footnotes whose original position falls inside this chunk's source
        // span move into the chunk's trailing section.
        let orig_start = lines[anchor_idx..end_idx]
            .iter()
            .find_map(|l| l.original_offset);
        let orig_end = lines[anchor_idx..end_idx]
            .iter()
            .rev()
            .find_map(|l| l.original_offset.map(|o| o + l.text.len() + 1));
        let is_last = i + 1 == anchor_indices.len();
        // A diverted footnote's offset is the position of the next kept
        // block, so membership is half-open on the left: (start, end].
        let footnotes: String = file
            .footnotes
            .iter()
            .filter(|fs| match (orig_start, orig_end) {
                (Some(s), Some(e)) => {
                    (fs.offset > s && fs.offset <= e)
                        || (i == 0 && fs.offset <= s)
                        || (is_last && fs.offset > e)
                }
                _ => is_last,
            })
            .map(|fs| format!("{}\n", fs.text))
            .collect();

        let id = chunk_id(book_id, &file.file, &anchor.dom_path, start_offset, end_offset);
        chunks.push(ChunkRecord {
            chunk_id: id,
            book_id: book_id.to_string(),
            heading: title.trim().to_string(),
            level,
            body,
            footnotes,
            provenance: Provenance {
                file: file.file.clone(),
                page: anchor.page,
                dom_anchor: anchor.dom_path.clone(),
                start_offset,
                end_offset,
            },
            status: ChunkStatus::Active,
        });
    }

    (chunks, miss)
}

/// Every chunk body must be byte-identical to the derived markup span its
/// provenance points at; anything else aborts before commit.
fn verify_chunk_bodies(chunks: &[ChunkRecord], markup: &str) -> Result<()> {
    for chunk in chunks {
        let span = markup
            .get(chunk.provenance.start_offset..chunk.provenance.end_offset)
            .ok_or_else(|| {
                PipelineError::InvariantViolation(format!(
                    "chunk {} provenance span out of bounds",
                    chunk.chunk_id
                ))
            })?;
        if span != chunk.body {
            return Err(PipelineError::InvariantViolation(format!(
                "chunk {} body does not match its source span",
                chunk.chunk_id
            ))
            .into());
        }
    }
    Ok(())
}

/// Canonical on-disk content of a chunk: verbatim body, then the diverted
/// footnotes under their own sub-section.
pub fn canonical_content(chunk: &ChunkRecord) -> String {
    if chunk.footnotes.is_empty() {
        chunk.body.clone()
    } else {
        format!("{}\n{}\n{}", chunk.body, FOOTNOTES_HEADING, chunk.footnotes)
    }
}
