//! The human approval gate and the run state machine.
//!
//! State per run: `PROPOSED → AWAITING_APPROVAL → APPROVED → APPLIED`, then
//! the second gate for the chunk plan: `PLAN_AWAITING_APPROVAL →
//! PLAN_APPROVED → COMMITTED`. Transitions only move forward, are atomic
//! (temp + rename of the state file), and are logged.
//!
//! An approval artifact must be a well-formed subset of the proposal:
//! every approved item matches a proposed item by candidate_id, at the same
//! or lower level, with an optional title edit. Anything else is an
//! [`PipelineError::ApprovalMismatch`] and the gate refuses to transition.
//! Approving a row the must-not-heading fixture blocked (without the auditor
//! override) is a [`PipelineError::MustNotHeading`].

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::artifacts;
use crate::error::PipelineError;
use crate::models::{ApprovedInjection, ProposedInjection, RunState};

/// Persisted run state (`run_state.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStateDoc {
    pub state: RunState,
    #[serde(default)]
    pub details: serde_json::Value,
}

pub fn read_state(run_book_dir: &Path) -> Result<RunStateDoc> {
    artifacts::read_json(&run_book_dir.join("run_state.json"))
}

pub fn write_state(run_book_dir: &Path, state: RunState, details: serde_json::Value) -> Result<()> {
    let doc = RunStateDoc { state, details };
    artifacts::write_json(&run_book_dir.join("run_state.json"), &doc)?;
    tracing::info!(state = %state, dir = %run_book_dir.display(), "run state transition");
    Ok(())
}

/// Enforce a forward-only transition from one of `expected` into `next`.
pub fn transition(
    run_book_dir: &Path,
    expected: &[RunState],
    next: RunState,
    details: serde_json::Value,
) -> Result<()> {
    let current = read_state(run_book_dir)?;
    if !expected.contains(&current.state) {
        if current.state < next {
            return Err(PipelineError::AwaitingApproval(format!(
                "state is {}, cannot reach {} yet",
                current.state, next
            ))
            .into());
        }
        return Err(PipelineError::ApprovalMismatch(format!(
            "state is {}, refusing transition to {}",
            current.state, next
        ))
        .into());
    }
    write_state(run_book_dir, next, details)
}

/// Validate an approval artifact against its proposal.
pub fn validate_approval(
    proposed: &[ProposedInjection],
    approved: &[ApprovedInjection],
) -> Result<()> {
    let by_id: BTreeMap<&str, &ProposedInjection> = proposed
        .iter()
        .map(|p| (p.candidate_id.as_str(), p))
        .collect();

    for item in approved {
        let Some(proposal) = by_id.get(item.candidate_id.as_str()) else {
            return Err(PipelineError::ApprovalMismatch(format!(
                "approved candidate {} is not in the proposal",
                item.candidate_id
            ))
            .into());
        };
        if proposal.blocked_by_must_not_heading {
            return Err(PipelineError::MustNotHeading {
                candidate_id: item.candidate_id.clone(),
                text: proposal.title_text.clone(),
            }
            .into());
        }
        if item.level > proposal.level {
            return Err(PipelineError::ApprovalMismatch(format!(
                "candidate {} approved at level {} above proposed level {}",
                item.candidate_id, item.level, proposal.level
            ))
            .into());
        }
        if item.file != proposal.file
            || item.file_index != proposal.file_index
            || item.insertion_offset != proposal.insertion_offset
        {
            return Err(PipelineError::ApprovalMismatch(format!(
                "candidate {} approval does not match the proposed location",
                item.candidate_id
            ))
            .into());
        }
    }
    Ok(())
}

/// Second gate: an approved chunk plan must be a subset of the proposed one
/// by chunk_id, with identical spans.
pub fn validate_plan_approval(
    proposed: &crate::placement::ChunkPlan,
    approved: &crate::placement::ChunkPlan,
) -> Result<()> {
    let by_id: BTreeMap<&str, &crate::placement::ChunkPlanItem> = proposed
        .items
        .iter()
        .map(|i| (i.chunk_id.as_str(), i))
        .collect();
    for item in &approved.items {
        let Some(proposal) = by_id.get(item.chunk_id.as_str()) else {
            return Err(PipelineError::ApprovalMismatch(format!(
                "approved chunk {} is not in the proposed plan",
                item.chunk_id
            ))
            .into());
        };
        if item.file != proposal.file
            || item.start_offset != proposal.start_offset
            || item.end_offset != proposal.end_offset
        {
            return Err(PipelineError::ApprovalMismatch(format!(
                "approved chunk {} does not match the proposed span",
                item.chunk_id
            ))
            .into());
        }
    }
    Ok(())
}

/// Bulk decision over a proposal: approve (or reject) every non-blocked row.
/// Produces the same artifact shape a hand-edited approval file has, so the
/// subset validation applies identically.
pub fn bulk_decide(
    proposed: &[ProposedInjection],
    approve: bool,
    reviewer: &str,
) -> Vec<ApprovedInjection> {
    if !approve {
        return Vec::new();
    }
    let approved_at = chrono::Utc::now().to_rfc3339();
    proposed
        .iter()
        .filter(|p| !p.blocked_by_must_not_heading)
        .map(|p| ApprovedInjection {
            candidate_id: p.candidate_id.clone(),
            file: p.file.clone(),
            file_index: p.file_index,
            insertion_offset: p.insertion_offset,
            level: p.level,
            title_text: p.title_text.clone(),
            edited_title: None,
            approved_by: reviewer.to_string(),
            approved_at: approved_at.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DecisionBasis;
    use tempfile::TempDir;

    fn proposal(id: &str, level: u8, blocked: bool) -> ProposedInjection {
        ProposedInjection {
            candidate_id: id.to_string(),
            signature: "sig".into(),
            file: "001.html".into(),
            file_index: 0,
            insertion_offset: 42,
            level,
            title_text: "باب الإدغام".into(),
            decision_basis: DecisionBasis::Rule,
            score: 0.9,
            oracle_result: None,
            blocked_by_must_not_heading: blocked,
            review_required: true,
        }
    }

    fn approval(id: &str, level: u8) -> ApprovedInjection {
        ApprovedInjection {
            candidate_id: id.to_string(),
            file: "001.html".into(),
            file_index: 0,
            insertion_offset: 42,
            level,
            title_text: "باب الإدغام".into(),
            edited_title: None,
            approved_by: "reviewer".into(),
            approved_at: "2025-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn subset_with_title_edit_passes() {
        let proposed = vec![proposal("a", 2, false), proposal("b", 2, false)];
        let mut item = approval("a", 2);
        item.edited_title = Some("باب الإدغام الكبير".into());
        assert!(validate_approval(&proposed, &[item]).is_ok());
    }

    #[test]
    fn unknown_candidate_is_mismatch() {
        let proposed = vec![proposal("a", 2, false)];
        let err = validate_approval(&proposed, &[approval("zzz", 2)]).unwrap_err();
        let pe = err.downcast_ref::<PipelineError>().unwrap();
        assert!(matches!(pe, PipelineError::ApprovalMismatch(_)));
    }

    #[test]
    fn raising_the_level_is_mismatch() {
        // Proposed at 3; approving at 2 (same or lower) is fine, 3→2 ok, 2→3 not.
        let proposed = vec![proposal("a", 3, false)];
        assert!(validate_approval(&proposed, &[approval("a", 2)]).is_ok());

        let proposed = vec![proposal("a", 2, false)];
        let err = validate_approval(&proposed, &[approval("a", 3)]).unwrap_err();
        let pe = err.downcast_ref::<PipelineError>().unwrap();
        assert!(matches!(pe, PipelineError::ApprovalMismatch(_)));
    }

    #[test]
    fn approving_a_blocked_row_is_must_not_violation() {
        let proposed = vec![proposal("a", 2, true)];
        let err = validate_approval(&proposed, &[approval("a", 2)]).unwrap_err();
        let pe = err.downcast_ref::<PipelineError>().unwrap();
        assert!(matches!(pe, PipelineError::MustNotHeading { .. }));
        assert_eq!(crate::error::exit_code_for(&err), 3);
    }

    #[test]
    fn moved_offset_is_mismatch() {
        let proposed = vec![proposal("a", 2, false)];
        let mut item = approval("a", 2);
        item.insertion_offset = 7;
        assert!(validate_approval(&proposed, &[item]).is_err());
    }

    #[test]
    fn bulk_approve_skips_blocked_rows_and_validates() {
        let proposed = vec![proposal("a", 2, false), proposal("b", 2, true)];
        let approved = bulk_decide(&proposed, true, "reviewer");
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].candidate_id, "a");
        assert!(validate_approval(&proposed, &approved).is_ok());

        assert!(bulk_decide(&proposed, false, "reviewer").is_empty());
    }

    #[test]
    fn state_machine_moves_forward_only() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run").join("book");
        write_state(&dir, RunState::AwaitingApproval, serde_json::json!({})).unwrap();

        transition(
            &dir,
            &[RunState::AwaitingApproval],
            RunState::Approved,
            serde_json::json!({}),
        )
        .unwrap();
        assert_eq!(read_state(&dir).unwrap().state, RunState::Approved);

        // Applying twice refuses (already past AwaitingApproval).
        let err = transition(
            &dir,
            &[RunState::AwaitingApproval],
            RunState::Approved,
            serde_json::json!({}),
        )
        .unwrap_err();
        assert!(err.downcast_ref::<PipelineError>().is_some());
    }

    #[test]
    fn premature_transition_reports_awaiting_approval() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run").join("book");
        write_state(&dir, RunState::AwaitingApproval, serde_json::json!({})).unwrap();

        // Trying to commit while still awaiting the first approval.
        let err = transition(
            &dir,
            &[RunState::PlanApproved],
            RunState::Committed,
            serde_json::json!({}),
        )
        .unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);
    }
}
