//! Pipeline error taxonomy.
//!
//! Every decision-affecting failure is one of the kinds below; local recovery
//! is limited to oracle transport. Anomalies that cannot be resolved
//! deterministically are routed to review rather than raised through the
//! pipeline (fail-closed).
//!
//! Exit-code mapping:
//!
//! | Kind | Exit code |
//! |------|-----------|
//! | `AwaitingApproval` | 2 |
//! | `MustNotHeading` | 3 |
//! | `InvariantViolation` | 4 |
//! | everything else | 1 |

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing file, undecodable or conflicting encoding, hash mismatch on rerun.
    #[error("input error at {}: {reason}", .path.display())]
    Input { path: PathBuf, reason: String },

    /// DOM parse failure. Fatal per file; the book fails closed.
    #[error("parse failure in {file}: {reason}")]
    Parse { file: String, reason: String },

    /// Network, throttle, or timeout failure after the retry budget is spent.
    #[error("oracle transient failure: {0}")]
    OracleTransient(String),

    /// The oracle replied, but not with the strict verdict schema.
    #[error("oracle protocol violation: {0}")]
    OracleProtocol(String),

    /// A proposed injection matched the must-not-heading fixture without override.
    #[error("must-not-heading violation for candidate {candidate_id}: {text}")]
    MustNotHeading { candidate_id: String, text: String },

    /// The approval artifact is not a well-formed subset of the proposal.
    #[error("approval mismatch: {0}")]
    ApprovalMismatch(String),

    /// A hard invariant failed (e.g. chunk body mismatch). The run aborts
    /// before commit; artifacts are preserved.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The requested stage needs an approval that has not been granted.
    #[error("run {0} is awaiting approval")]
    AwaitingApproval(String),
}

impl PipelineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::AwaitingApproval(_) => 2,
            PipelineError::MustNotHeading { .. } => 3,
            PipelineError::InvariantViolation(_) => 4,
            _ => 1,
        }
    }
}

/// Map any error chain to a process exit code, honoring the taxonomy above.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<PipelineError>() {
        Some(e) => e.exit_code(),
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(
            PipelineError::AwaitingApproval("r1".into()).exit_code(),
            2
        );
        assert_eq!(
            PipelineError::MustNotHeading {
                candidate_id: "c".into(),
                text: "مسألة:".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(
            PipelineError::InvariantViolation("body mismatch".into()).exit_code(),
            4
        );
        assert_eq!(
            PipelineError::OracleTransient("timeout".into()).exit_code(),
            1
        );
    }

    #[test]
    fn downcast_through_anyhow() {
        let err: anyhow::Error = PipelineError::InvariantViolation("x".into()).into();
        assert_eq!(exit_code_for(&err), 4);
        let plain = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&plain), 1);
    }
}
