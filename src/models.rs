//! Core data models flowing through the heading-recovery pipeline.
//!
//! The lifecycle is:
//!
//! ```text
//! source_raw/*.html → FileRecord (manifest)
//!                   → Block (normalized DOM)
//!                   → Candidate (Layer A)
//!                   → Decision (Layer B + optional oracle)
//!                   → ProposedInjection → ApprovedInjection (gate)
//!                   → ChunkRecord → Topic placement → Projection
//! ```
//!
//! Candidates, chunks, and topics are immutable once emitted; corrections
//! produce new records and deprecate the old ones. Every type serializes with
//! `serde` so the run artifacts are plain JSON/JSONL.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed set of sciences a book can belong to (from `meta.json`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Science {
    Fiqh,
    Aqidah,
    #[serde(rename = "Usul_al_Fiqh")]
    UsulAlFiqh,
    Imla,
    Tajwid,
    Sarf,
    Nahw,
    Balaghah,
    #[serde(rename = "Islamic_History")]
    IslamicHistory,
}

impl FromStr for Science {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Fiqh" => Ok(Science::Fiqh),
            "Aqidah" => Ok(Science::Aqidah),
            "Usul_al_Fiqh" => Ok(Science::UsulAlFiqh),
            "Imla" => Ok(Science::Imla),
            "Tajwid" => Ok(Science::Tajwid),
            "Sarf" => Ok(Science::Sarf),
            "Nahw" => Ok(Science::Nahw),
            "Balaghah" => Ok(Science::Balaghah),
            "Islamic_History" => Ok(Science::IslamicHistory),
            other => Err(format!("unknown science: {other}")),
        }
    }
}

impl fmt::Display for Science {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Science::Fiqh => "Fiqh",
            Science::Aqidah => "Aqidah",
            Science::UsulAlFiqh => "Usul_al_Fiqh",
            Science::Imla => "Imla",
            Science::Tajwid => "Tajwid",
            Science::Sarf => "Sarf",
            Science::Nahw => "Nahw",
            Science::Balaghah => "Balaghah",
            Science::IslamicHistory => "Islamic_History",
        };
        f.write_str(s)
    }
}

/// Per-book metadata sidecar (`meta.json` next to `source_raw/`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookMeta {
    pub science: Science,
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
}

/// One source file in the frozen ingest manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the book's `source_raw/` directory.
    pub path: String,
    pub size: u64,
    /// Digest of the raw bytes, not the decoded text.
    pub sha256: String,
    pub encoding: String,
    pub order_index: usize,
}

/// Structural-noise classification assigned by the DOM normalizer.
///
/// Noise is annotated, never deleted: the block stays addressable and the
/// derived markup decides per tag whether to keep, drop, or divert it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseTag {
    Pagehead,
    PageMarker,
    Footnote,
    Metadata,
}

/// Coarse classification of what a candidate's surface looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    Title,
    Metadata,
    Pagehead,
    Footnote,
    Body,
}

/// A potential heading discovered in the DOM (Layer A output). Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// sha256(book_id ‖ file_index ‖ dom_path ‖ normalized_text), hex.
    pub candidate_id: String,
    /// Exact surface text (normalized whitespace only).
    pub text: String,
    pub kind: CandidateKind,
    /// Hex digest of the structural fingerprint tuple.
    pub signature: String,
    pub context_before: String,
    pub context_after: String,
    pub html_excerpt: String,
    pub dom_path: String,
    #[serde(default)]
    pub page_index: Option<u32>,
    pub file: String,
    pub file_index: usize,
    /// Byte offset of this block's line in the file's derived markup.
    pub start_offset: usize,
    pub end_offset: usize,
}

/// Three-valued Layer B suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suggestion {
    True,
    False,
    Unknown,
}

/// Why the scorer (or oracle) classified the line the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonTag {
    Title,
    Metadata,
    Footnote,
    Pagehead,
    BodyLine,
}

/// Layer B output for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub candidate_id: String,
    /// Bounded score in [0, 1].
    pub score: f64,
    pub suggested_is_heading: Suggestion,
    /// 2 or 3.
    pub suggested_level: u8,
    pub reason: ReasonTag,
    pub confidence: f64,
    pub must_not_match: bool,
    pub rationale: Vec<String>,
}

/// Strict oracle verdict. Deserialization fails on any missing field, which
/// is exactly the protocol contract: replies with missing/null fields are
/// failures and get retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleVerdict {
    pub is_heading: bool,
    pub level: u8,
    pub normalized_title: String,
    pub confidence: f64,
    pub reason: ReasonTag,
}

/// Which layer(s) produced the final call for a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionBasis {
    #[serde(rename = "rule")]
    Rule,
    #[serde(rename = "oracle")]
    Oracle,
    #[serde(rename = "rule+oracle")]
    RuleOracle,
}

/// Merged Layer B + Layer C decision, in canonical candidate order
/// (`heading_decisions.jsonl`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub candidate_id: String,
    pub score: Score,
    pub basis: DecisionBasis,
    #[serde(default)]
    pub oracle: Option<OracleVerdict>,
    /// The oracle was consulted and failed after retries; suggestion stays Unknown.
    #[serde(default)]
    pub oracle_error: bool,
}

/// One row of `heading_injections.proposed.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedInjection {
    pub candidate_id: String,
    /// Structural fingerprint of the candidate, carried through to the
    /// report's traceability table.
    pub signature: String,
    pub file: String,
    pub file_index: usize,
    /// Byte offset into the file's derived markup where the heading line is inserted.
    pub insertion_offset: usize,
    pub level: u8,
    pub title_text: String,
    pub decision_basis: DecisionBasis,
    pub score: f64,
    #[serde(default)]
    pub oracle_result: Option<OracleVerdict>,
    /// Blocked rows are present in the proposal but never injected.
    pub blocked_by_must_not_heading: bool,
    /// Always true: nothing injects without the human gate.
    pub review_required: bool,
}

/// One row of `heading_injections.approved.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedInjection {
    pub candidate_id: String,
    pub file: String,
    pub file_index: usize,
    pub insertion_offset: usize,
    /// Must be ≤ the proposed level.
    pub level: u8,
    pub title_text: String,
    #[serde(default)]
    pub edited_title: Option<String>,
    pub approved_by: String,
    pub approved_at: String,
}

impl ApprovedInjection {
    /// The title that actually gets injected.
    pub fn effective_title(&self) -> &str {
        self.edited_title.as_deref().unwrap_or(&self.title_text)
    }
}

/// Where a chunk's bytes came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub file: String,
    #[serde(default)]
    pub page: Option<u32>,
    /// dom_path of the anchor block (or of the first block for anchor-miss regions).
    pub dom_anchor: String,
    pub start_offset: usize,
    pub end_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Active,
    Deprecated,
}

/// An append-only, byte-faithful extraction of source content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// sha256(book_id ‖ file ‖ dom_anchor ‖ start_offset ‖ end_offset), hex.
    pub chunk_id: String,
    pub book_id: String,
    pub heading: String,
    pub level: u8,
    /// Verbatim body, anchor line included.
    pub body: String,
    /// Footnote content diverted out of the body span, verbatim.
    pub footnotes: String,
    pub provenance: Provenance,
    pub status: ChunkStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicStatus {
    Active,
    Merged,
    Deprecated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatedBy {
    Rule,
    Oracle,
    Human,
}

/// A node of the topic taxonomy. `topic_id` is immutable forever; folder
/// renames never change identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    /// Stable `T######` identifier.
    pub topic_id: String,
    #[serde(default)]
    pub parent_topic_id: Option<String>,
    pub display_title_ar: String,
    #[serde(default)]
    pub display_title_en: Option<String>,
    #[serde(default)]
    pub aliases_ar: Vec<String>,
    #[serde(default)]
    pub aliases_en: Vec<String>,
    pub status: TopicStatus,
    pub created_by: CreatedBy,
    pub created_at: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Hardlink,
    Copy,
}

/// One materialized row of the topic-folder projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionRow {
    pub topic_id: String,
    pub chunk_id: String,
    pub canonical_path: String,
    pub projected_path: String,
    pub link_type: LinkType,
}

/// The run-level state machine. Transitions only move forward; the approval
/// gate refuses anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Proposed,
    AwaitingApproval,
    Approved,
    Applied,
    PlanAwaitingApproval,
    PlanApproved,
    Committed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Proposed => "PROPOSED",
            RunState::AwaitingApproval => "AWAITING_APPROVAL",
            RunState::Approved => "APPROVED",
            RunState::Applied => "APPLIED",
            RunState::PlanAwaitingApproval => "PLAN_AWAITING_APPROVAL",
            RunState::PlanApproved => "PLAN_APPROVED",
            RunState::Committed => "COMMITTED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn science_roundtrip() {
        for name in [
            "Fiqh",
            "Aqidah",
            "Usul_al_Fiqh",
            "Imla",
            "Tajwid",
            "Sarf",
            "Nahw",
            "Balaghah",
            "Islamic_History",
        ] {
            let s: Science = name.parse().unwrap();
            assert_eq!(s.to_string(), name);
        }
        assert!("Chemistry".parse::<Science>().is_err());
    }

    #[test]
    fn oracle_verdict_rejects_missing_fields() {
        let ok = r#"{"is_heading":true,"level":2,"normalized_title":"باب","confidence":0.9,"reason":"title"}"#;
        assert!(serde_json::from_str::<OracleVerdict>(ok).is_ok());

        let missing = r#"{"is_heading":true,"level":2,"confidence":0.9,"reason":"title"}"#;
        assert!(serde_json::from_str::<OracleVerdict>(missing).is_err());

        let null_field = r#"{"is_heading":true,"level":2,"normalized_title":null,"confidence":0.9,"reason":"title"}"#;
        assert!(serde_json::from_str::<OracleVerdict>(null_field).is_err());
    }

    #[test]
    fn decision_basis_wire_format() {
        assert_eq!(
            serde_json::to_string(&DecisionBasis::RuleOracle).unwrap(),
            r#""rule+oracle""#
        );
    }

    #[test]
    fn effective_title_prefers_edit() {
        let a = ApprovedInjection {
            candidate_id: "c".into(),
            file: "001.html".into(),
            file_index: 0,
            insertion_offset: 0,
            level: 2,
            title_text: "باب الادغام".into(),
            edited_title: Some("باب الإدغام".into()),
            approved_by: "reviewer".into(),
            approved_at: "2025-01-01T00:00:00Z".into(),
        };
        assert_eq!(a.effective_title(), "باب الإدغام");
    }

    #[test]
    fn run_state_is_ordered() {
        assert!(RunState::Proposed < RunState::Approved);
        assert!(RunState::Applied < RunState::Committed);
    }
}
