//! Layer A: heading candidate generation from DOM signatures.
//!
//! A candidate is emitted for every block matching at least one trigger:
//! centering, typographic emphasis, a reference-specific class, separator
//! adjacency (horizontal rule or an empty-line gap), or an Arabic heading
//! token at the start of the text. Candidates are immutable once emitted and
//! their identifiers are pure functions of the inputs, so reruns on identical
//! bytes reproduce identical IDs in identical order.

use sha2::{Digest, Sha256};

use crate::dom::NormalizedFile;
use crate::models::{Candidate, CandidateKind, NoiseTag};
use crate::textnorm;

/// Class tokens specific to the reference desktop application's exports.
const REFERENCE_CLASSES: &[&str] = &[
    "title",
    "partname",
    "pagehead",
    "pagetext",
    "pagenumber",
    "footnote",
];

/// Structural facts the scorer needs alongside the candidate itself.
#[derive(Debug, Clone)]
pub struct StructuralFeatures {
    /// Not adjacent to plain text on either side (start/end/hr/gap).
    pub isolated: bool,
    pub centered: bool,
    pub bold: bool,
    pub font_larger: bool,
    pub title_class: bool,
    pub preceded_by_hr: bool,
    pub in_metadata_zone: bool,
    pub in_footnote_zone: bool,
    pub is_pagehead: bool,
    /// Block repetition key for the scorer's pagehead-repetition feature.
    pub repetition_key: String,
}

/// A candidate plus the block-level features that produced it.
#[derive(Debug, Clone)]
pub struct CandidateSeed {
    pub candidate: Candidate,
    pub features: StructuralFeatures,
}

/// Deterministic candidate identity:
/// sha256(book_id ‖ file_index ‖ dom_path ‖ normalized_text), hex.
pub fn candidate_id(book_id: &str, file_index: usize, dom_path: &str, normalized_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(book_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(file_index.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(dom_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn has_reference_class(classes: &[String]) -> bool {
    classes
        .iter()
        .any(|c| REFERENCE_CLASSES.iter().any(|r| c.contains(r)))
}

fn kind_for(block: &crate::dom::Block) -> CandidateKind {
    if block.noise == Some(NoiseTag::Footnote)
        || block.classes.iter().any(|c| c.contains("footnote"))
    {
        return CandidateKind::Footnote;
    }
    if block.noise == Some(NoiseTag::Pagehead)
        || block.classes.iter().any(|c| c.contains("pagehead"))
    {
        return CandidateKind::Pagehead;
    }
    if block.noise == Some(NoiseTag::Metadata) || textnorm::contains_metadata_token(&block.text) {
        return CandidateKind::Metadata;
    }
    if textnorm::begins_with_heading_token(&block.text)
        || block.classes.iter().any(|c| c.contains("title"))
    {
        return CandidateKind::Title;
    }
    CandidateKind::Body
}

/// Emit candidates for one book in canonical order (file_index, then
/// depth-first block order).
pub fn generate_candidates(book_id: &str, files: &[NormalizedFile]) -> Vec<CandidateSeed> {
    let mut seeds = Vec::new();

    for file in files {
        // Nearest non-empty neighbor texts, for context excerpts.
        let texts: Vec<&str> = file.blocks.iter().map(|b| b.text.as_str()).collect();

        for (i, block) in file.blocks.iter().enumerate() {
            if block.text.is_empty() || block.noise == Some(NoiseTag::PageMarker) {
                continue;
            }

            let emphasis = block.bold || block.font_larger;
            let separator_adjacent =
                block.preceded_by_hr || block.followed_by_hr || block.gap_before;
            let lexical = textnorm::begins_with_heading_token(&block.text);
            let triggered = block.centered
                || emphasis
                || has_reference_class(&block.classes)
                || separator_adjacent
                || lexical;
            if !triggered {
                continue;
            }

            let context_before = texts[..i]
                .iter()
                .rev()
                .find(|t| !t.is_empty())
                .copied()
                .unwrap_or("")
                .to_string();
            let context_after = texts[i + 1..]
                .iter()
                .find(|t| !t.is_empty())
                .copied()
                .unwrap_or("")
                .to_string();

            let candidate = Candidate {
                candidate_id: candidate_id(book_id, file.file_index, &block.dom_path, &block.text),
                text: block.text.clone(),
                kind: kind_for(block),
                signature: block.signature.clone(),
                context_before,
                context_after,
                html_excerpt: block.html_excerpt.clone(),
                dom_path: block.dom_path.clone(),
                page_index: block.page_index,
                file: file.file.clone(),
                file_index: file.file_index,
                start_offset: block.derived_offset,
                end_offset: block.derived_offset + if block.in_markup { block.text.len() } else { 0 },
            };
            let features = StructuralFeatures {
                isolated: block.prev_kind != "text" && block.next_kind != "text",
                centered: block.centered,
                bold: block.bold,
                font_larger: block.font_larger,
                title_class: block.classes.iter().any(|c| c.contains("title")),
                preceded_by_hr: block.preceded_by_hr,
                in_metadata_zone: block.noise == Some(NoiseTag::Metadata),
                in_footnote_zone: block.noise == Some(NoiseTag::Footnote),
                is_pagehead: block.noise == Some(NoiseTag::Pagehead),
                repetition_key: block.repetition_key.clone(),
            };
            seeds.push(CandidateSeed { candidate, features });
        }
    }

    seeds
}
