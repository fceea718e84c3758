//! # IBP CLI (`ibp`)
//!
//! The `ibp` binary drives the review-gated book processing pipeline.
//!
//! ## Usage
//!
//! ```bash
//! ibp --config ./ibp.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ibp ingest <book_id>` | Scan, score, and propose heading injections |
//! | `ibp approve-headings <run_id>` | Consume the heading approval artifact (first gate) |
//! | `ibp apply <run_id>` | Inject, split, and propose the chunk plan |
//! | `ibp approve-plan <run_id>` | Consume the chunk plan approval (second gate) |
//! | `ibp commit <run_id>` | Write canonical chunks, registry, and projection |
//! | `ibp clean-book <book_id>` | Archive all prior outputs for a book |
//!
//! ## Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | success |
//! | 2 | awaiting approval |
//! | 3 | blocked by must-not-heading without override |
//! | 4 | invariant violation |
//! | 1 | other error |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use ibp::config;
use ibp::error::exit_code_for;
use ibp::pipeline;

/// Islamic Book Processor — heading recovery and review-gated chunking for
/// Arabic HTML book exports.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file with the books, runs, corpus, cache, and fixtures paths.
#[derive(Parser)]
#[command(
    name = "ibp",
    about = "Islamic Book Processor — review-gated heading recovery and chunking",
    version,
    long_about = "IBP ingests Arabic Islamic books exported as HTML, recovers structural \
    heading anchors through deterministic scoring plus an advisory oracle, and applies \
    human-approved plans into canonical, provenance-tracked topic chunks. Every \
    content-affecting step is gated on explicit approval."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./ibp.toml")]
    config: PathBuf,

    /// Disable the oracle entirely (Layer C is skipped, not cached).
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan, score, and emit the heading proposal for review.
    ///
    /// Freezes the book's input state, scores every heading candidate, and
    /// writes `heading_injections.proposed.jsonl` plus the run report.
    /// Ends in the AWAITING_APPROVAL state.
    Ingest {
        /// Book identifier (directory under books_root).
        book_id: String,

        /// Pin the run id's timestamp component for reproducible reruns.
        #[arg(long)]
        run_id: Option<String>,

        /// Archive all prior outputs for this book before running.
        #[arg(long)]
        clean_book: bool,

        /// Audited override: propose candidates the must-not-heading
        /// fixture would block. Every lifted row is logged.
        #[arg(long)]
        override_must_not: bool,
    },

    /// Consume the heading approval artifact (first gate).
    ///
    /// Accepts a reviewer-edited `heading_injections.approved.jsonl` or a
    /// bulk `--approve-all` / `--reject-all` decision. The approval must be
    /// a well-formed subset of the proposal.
    ApproveHeadings {
        run_id: String,

        #[arg(long)]
        book_id: String,

        /// Path to a reviewer-edited approval JSONL.
        #[arg(long)]
        approval_file: Option<PathBuf>,

        /// Approve every non-blocked proposed injection.
        #[arg(long)]
        approve_all: bool,

        /// Reject every proposed injection.
        #[arg(long)]
        reject_all: bool,

        #[arg(long, default_value = "human")]
        reviewer: String,
    },

    /// Inject approved headings, split on strict anchors, and
    /// propose chunk placements (second gate input).
    Apply {
        run_id: String,

        #[arg(long)]
        book_id: String,
    },

    /// Consume the chunk plan approval (second gate).
    ApprovePlan {
        run_id: String,

        #[arg(long)]
        book_id: String,

        /// Path to a reviewer-edited chunk_plan.approved.json.
        #[arg(long)]
        approval_file: Option<PathBuf>,

        #[arg(long)]
        approve_all: bool,

        #[arg(long)]
        reject_all: bool,

        #[arg(long, default_value = "human")]
        reviewer: String,
    },

    /// Write canonical chunks, registry rows, and the topic
    /// projection. Transactional; idempotent on rerun.
    Commit {
        run_id: String,

        #[arg(long)]
        book_id: String,
    },

    /// Archive all prior outputs for a book under `_ARCHIVE/`. Never
    /// deletes in place.
    CleanBook {
        book_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ibp=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Commands::Ingest {
            ref book_id,
            ref run_id,
            clean_book,
            override_must_not,
        } => pipeline::run_ingest(
            &cfg,
            book_id,
            run_id.as_deref(),
            clean_book,
            cli.dry_run,
            override_must_not,
        )
        .await
        .map(|_| ()),
        Commands::ApproveHeadings {
            ref run_id,
            ref book_id,
            ref approval_file,
            approve_all,
            reject_all,
            ref reviewer,
        } => {
            if approve_all && reject_all {
                eprintln!("error: --approve-all and --reject-all are mutually exclusive");
                return ExitCode::from(1);
            }
            pipeline::run_approve_headings(
                &cfg,
                run_id,
                book_id,
                approval_file.as_deref(),
                approve_all,
                reject_all,
                reviewer,
            )
        }
        Commands::Apply {
            ref run_id,
            ref book_id,
        } => pipeline::run_apply(&cfg, run_id, book_id).await,
        Commands::ApprovePlan {
            ref run_id,
            ref book_id,
            ref approval_file,
            approve_all,
            reject_all,
            ref reviewer,
        } => {
            if approve_all && reject_all {
                eprintln!("error: --approve-all and --reject-all are mutually exclusive");
                return ExitCode::from(1);
            }
            pipeline::run_approve_plan(
                &cfg,
                run_id,
                book_id,
                approval_file.as_deref(),
                approve_all,
                reject_all,
                reviewer,
            )
        }
        Commands::Commit {
            ref run_id,
            ref book_id,
        } => pipeline::run_commit(&cfg, run_id, book_id).await,
        Commands::CleanBook { ref book_id } => pipeline::run_clean_book(&cfg, book_id),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err) as u8)
        }
    }
}
