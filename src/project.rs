//! Filesystem side of the corpus: canonical chunk files, the topic-folder
//! projection, special zones, and archival.
//!
//! The registry is the source of truth; everything under `topics/` is a
//! regenerable projection. Canonical chunk files are created exactly once
//! and never reopened for write. `clean-book` archives — it never deletes
//! in place.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::inject::{canonical_content, AnchorMissDiagnostic};
use crate::models::{ChunkRecord, LinkType};

/// Windows reserved device names a folder segment must not collide with.
const WINDOWS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Maximum folder segment length in characters; the full title stays in the
/// registry.
const MAX_SEGMENT_CHARS: usize = 80;

/// Cross-platform-safe path component: NFC, spaces to underscores, illegal
/// and control characters stripped, trailing dots/spaces trimmed, reserved
/// names suffixed, capped at 80 characters.
pub fn sanitize_component(value: &str) -> String {
    use unicode_normalization::UnicodeNormalization;

    let nfc: String = value.nfc().collect();
    let mut cleaned: String = nfc
        .chars()
        .map(|c| match c {
            ' ' => '_',
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if (c as u32) < 0x20 => '_',
            other => other,
        })
        .collect();

    while cleaned.ends_with('.') || cleaned.ends_with(' ') || cleaned.ends_with('_') {
        cleaned.pop();
    }
    if cleaned.is_empty() {
        cleaned = "unnamed".to_string();
    }
    if WINDOWS_RESERVED.contains(&cleaned.to_uppercase().as_str()) {
        cleaned.push('_');
    }
    cleaned.chars().take(MAX_SEGMENT_CHARS).collect()
}

/// `T######__<sanitized-title>` folder segment.
pub fn topic_folder_name(topic_id: &str, display_title_ar: &str) -> String {
    let safe = sanitize_component(if display_title_ar.is_empty() {
        topic_id
    } else {
        display_title_ar
    });
    format!("{topic_id}__{safe}")
}

/// Write a canonical chunk file if it does not already exist. Canonical
/// files are write-once; reruns of an applied plan leave them untouched.
pub fn write_canonical(chunks_dir: &Path, chunk: &ChunkRecord) -> Result<(PathBuf, bool)> {
    std::fs::create_dir_all(chunks_dir)
        .with_context(|| format!("creating {}", chunks_dir.display()))?;
    let path = chunks_dir.join(format!("chunk_{}.md", chunk.chunk_id));
    if path.exists() {
        return Ok((path, false));
    }
    crate::artifacts::write_atomic(&path, canonical_content(chunk).as_bytes())?;
    Ok((path, true))
}

/// Materialize one projection link: hardlink first, copy on failure.
pub fn project_chunk(
    canonical_path: &Path,
    topic_dir: &Path,
    file_name: &str,
) -> Result<(PathBuf, LinkType)> {
    std::fs::create_dir_all(topic_dir)
        .with_context(|| format!("creating {}", topic_dir.display()))?;
    let projected = topic_dir.join(file_name);
    if projected.exists() {
        std::fs::remove_file(&projected)
            .with_context(|| format!("replacing {}", projected.display()))?;
    }
    match std::fs::hard_link(canonical_path, &projected) {
        Ok(()) => Ok((projected, LinkType::Hardlink)),
        Err(err) => {
            tracing::debug!(
                canonical = %canonical_path.display(),
                error = %err,
                "hardlink failed, falling back to copy"
            );
            std::fs::copy(canonical_path, &projected)
                .with_context(|| format!("copying into {}", projected.display()))?;
            Ok((projected, LinkType::Copy))
        }
    }
}

/// Write the `_ANCHOR_MISS/<book_id>/<file>.md` diagnostics.
pub fn write_anchor_miss(
    zone_root: &Path,
    book_id: &str,
    diagnostics: &[AnchorMissDiagnostic],
) -> Result<()> {
    let dir = zone_root.join("_ANCHOR_MISS").join(book_id);
    for diag in diagnostics {
        let mut lines = vec![
            format!("# Anchor miss — {}", diag.file),
            String::new(),
            format!("- lines in region: {}", diag.line_count),
            format!("- span: bytes {}..{}", diag.start_offset, diag.end_offset),
            String::new(),
        ];
        if diag.candidate_snippets.is_empty() {
            lines.push("No heading candidates were detected in this region.".to_string());
        } else {
            lines.push("## Candidate snippets present but not injected".to_string());
            lines.extend(diag.candidate_snippets.iter().map(|s| format!("- {s}")));
        }
        if !diag.preview.is_empty() {
            lines.push(String::new());
            lines.push("## Region preview".to_string());
            lines.extend(diag.preview.iter().map(|s| format!("> {s}")));
        }
        lines.push(String::new());
        let path = dir.join(format!("{}.md", diag.file));
        crate::artifacts::write_atomic(&path, lines.join("\n").as_bytes())?;
    }
    Ok(())
}

/// Route a fail-closed anomaly to the `_REVIEW/` zone with its evidence.
pub fn write_review_entry(
    zone_root: &Path,
    book_id: &str,
    name: &str,
    evidence: &serde_json::Value,
) -> Result<()> {
    let path = zone_root
        .join("_REVIEW")
        .join(book_id)
        .join(format!("{name}.json"));
    crate::artifacts::write_json(&path, evidence)
}

/// Archive every prior output for a book under `_ARCHIVE/<book_id>/<stamp>/`.
/// Moves, never deletes. Returns how many directories were relocated.
pub fn archive_book_outputs(
    runs_root: &Path,
    corpus_science_root: &Path,
    book_id: &str,
) -> Result<usize> {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let archive_root = corpus_science_root
        .join("_ARCHIVE")
        .join(book_id)
        .join(&stamp);
    let mut moved = 0usize;

    // Run directories for this book.
    if runs_root.is_dir() {
        let mut run_dirs: Vec<PathBuf> = std::fs::read_dir(runs_root)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir() && p.file_name().map(|n| n != "_ARCHIVE").unwrap_or(false))
            .collect();
        run_dirs.sort();
        for run_dir in run_dirs {
            let book_dir = run_dir.join(book_id);
            if !book_dir.exists() {
                continue;
            }
            let run_name = run_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let dest = archive_root.join("runs").join(&run_name);
            move_dir(&book_dir, &dest)?;
            moved += 1;
        }
    }

    // Corpus outputs.
    for zone in ["chunks_by_book", "_ANCHOR_MISS", "_REVIEW"] {
        let src = corpus_science_root.join(zone).join(book_id);
        if src.exists() {
            let dest = archive_root.join(zone);
            move_dir(&src, &dest)?;
            moved += 1;
        }
    }

    if moved > 0 {
        tracing::info!(book_id, stamp, moved, "archived prior book outputs");
    }
    Ok(moved)
}

fn move_dir(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(src, dest)
        .with_context(|| format!("moving {} -> {}", src.display(), dest.display()))
}
