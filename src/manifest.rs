//! Ingest manifesting: deterministic file enumeration, encoding detection,
//! and content hashing.
//!
//! The manifest freezes the input state of a book. File order is the
//! lexicographic order of relative paths; hashes are over raw bytes; the
//! NFC-normalized decoded text is hashed separately ("fingerprint") and only
//! ever used to seed the run identifier — raw bytes are preserved everywhere
//! else. Encoding handling fails closed: a file whose bytes and declared
//! charset disagree aborts the ingest rather than guessing.

use anyhow::Result;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

use crate::error::PipelineError;
use crate::models::FileRecord;
use serde::{Deserialize, Serialize};

/// A decoded source file with its frozen manifest record.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub record: FileRecord,
    /// Decoded text (whitespace untouched).
    pub text: String,
    /// sha256 of the NFC-normalized text; feeds the run id only.
    pub nfc_fingerprint: String,
}

/// The `ingest_manifest.json` artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestManifest {
    pub book_id: String,
    pub file_count: usize,
    pub files: Vec<FileRecord>,
}

fn charset_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)charset\s*=\s*["']?([A-Za-z0-9_\-]+)"#).unwrap())
}

/// Enumerate the book's HTML files in stable lexicographic order.
pub fn sorted_source_files(source_raw: &Path) -> Result<Vec<PathBuf>> {
    if !source_raw.is_dir() {
        return Err(PipelineError::Input {
            path: source_raw.to_path_buf(),
            reason: "source_raw directory not found".into(),
        }
        .into());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(source_raw)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .map(|ext| {
                        let ext = ext.to_string_lossy().to_lowercase();
                        ext == "htm" || ext == "html"
                    })
                    .unwrap_or(false)
        })
        .collect();
    files.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));
    if files.is_empty() {
        return Err(PipelineError::Input {
            path: source_raw.to_path_buf(),
            reason: "no .htm/.html files found".into(),
        }
        .into());
    }
    Ok(files)
}

/// Decode file bytes, preferring UTF-8, falling back to the charset the file
/// itself declares. A declared non-UTF-8 charset on a file that also decodes
/// as non-ASCII UTF-8 is a conflict and fails closed.
pub fn decode_text(path: &Path, bytes: &[u8]) -> Result<(String, String)> {
    let declared = sniff_declared_charset(bytes);

    // BOM-led UTF-8 first.
    let without_bom = bytes.strip_prefix(&[0xef, 0xbb, 0xbf]).unwrap_or(bytes);

    if let Ok(text) = std::str::from_utf8(without_bom) {
        let is_ascii = without_bom.is_ascii();
        match declared.as_deref() {
            None => return Ok((text.to_string(), "utf-8".into())),
            Some(d) if is_utf8_label(d) => return Ok((text.to_string(), "utf-8".into())),
            // ASCII is a subset of every charset we accept.
            Some(_) if is_ascii => return Ok((text.to_string(), "utf-8".into())),
            Some(d) => {
                return Err(PipelineError::Input {
                    path: path.to_path_buf(),
                    reason: format!(
                        "bytes decode as UTF-8 but file declares charset '{d}'; refusing to guess"
                    ),
                }
                .into());
            }
        }
    }

    // Not valid UTF-8: the declared charset must carry it.
    let label = declared.ok_or_else(|| PipelineError::Input {
        path: path.to_path_buf(),
        reason: "not valid UTF-8 and no charset declared".into(),
    })?;
    let encoding = encoding_rs::Encoding::for_label(label.as_bytes()).ok_or_else(|| {
        PipelineError::Input {
            path: path.to_path_buf(),
            reason: format!("unknown declared charset '{label}'"),
        }
    })?;
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        return Err(PipelineError::Input {
            path: path.to_path_buf(),
            reason: format!("bytes are not valid {}", encoding.name()),
        }
        .into());
    }
    Ok((text.into_owned(), encoding.name().to_lowercase()))
}

fn is_utf8_label(label: &str) -> bool {
    matches!(label.to_lowercase().as_str(), "utf-8" | "utf8")
}

/// Pull a `charset=` declaration out of the head bytes (http-equiv or meta).
fn sniff_declared_charset(bytes: &[u8]) -> Option<String> {
    // Charset declarations live in the ASCII-compatible prefix.
    let head = &bytes[..bytes.len().min(4096)];
    let lossy = String::from_utf8_lossy(head);
    charset_re()
        .captures(&lossy)
        .map(|c| c[1].to_lowercase())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Read, decode, and hash every source file of a book.
pub fn load_book(books_root: &Path, book_id: &str) -> Result<(Vec<SourceFile>, IngestManifest)> {
    let source_raw = books_root.join(book_id).join("source_raw");
    let paths = sorted_source_files(&source_raw)?;

    let mut sources = Vec::with_capacity(paths.len());
    let mut records = Vec::with_capacity(paths.len());

    for (order_index, path) in paths.iter().enumerate() {
        let bytes = std::fs::read(path).map_err(|e| PipelineError::Input {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let (text, encoding) = decode_text(path, &bytes)?;
        let nfc: String = text.nfc().collect();

        let record = FileRecord {
            path: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
            encoding,
            order_index,
        };
        records.push(record.clone());
        sources.push(SourceFile {
            path: path.clone(),
            record,
            text,
            nfc_fingerprint: sha256_hex(nfc.as_bytes()),
        });
    }

    let manifest = IngestManifest {
        book_id: book_id.to_string(),
        file_count: records.len(),
        files: records,
    };
    Ok((sources, manifest))
}

/// Digest over the ordered (path, NFC fingerprint) pairs; seeds the run id.
pub fn manifest_digest(sources: &[SourceFile]) -> String {
    let mut hasher = Sha256::new();
    for s in sources {
        hasher.update(s.record.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(s.nfc_fingerprint.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// `<stamp>-<manifest prefix>`; the stamp is UTC now unless pinned by the caller.
pub fn make_run_id(stamp: Option<&str>, digest: &str) -> String {
    let stamp = match stamp {
        Some(s) => s.to_string(),
        None => chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
    };
    format!("{}-{}", stamp, &digest[..8])
}

/// Verify that a rerun sees the same frozen inputs. Hash mismatch fails closed.
pub fn verify_manifest_unchanged(prior: &IngestManifest, current: &IngestManifest) -> Result<()> {
    if prior.files.len() != current.files.len() {
        return Err(PipelineError::Input {
            path: PathBuf::from(&prior.book_id),
            reason: format!(
                "file count changed since manifest was frozen: {} -> {}",
                prior.files.len(),
                current.files.len()
            ),
        }
        .into());
    }
    for (a, b) in prior.files.iter().zip(current.files.iter()) {
        if a.path != b.path || a.sha256 != b.sha256 {
            return Err(PipelineError::Input {
                path: PathBuf::from(&b.path),
                reason: format!("hash mismatch on rerun (manifest has {})", a.sha256),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn book_dir(tmp: &TempDir, book_id: &str) -> PathBuf {
        let dir = tmp.path().join(book_id).join("source_raw");
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn files_enumerate_in_lexicographic_order() {
        let tmp = TempDir::new().unwrap();
        let dir = book_dir(&tmp, "b1");
        fs::write(dir.join("010.html"), "<p>c</p>").unwrap();
        fs::write(dir.join("002.html"), "<p>b</p>").unwrap();
        fs::write(dir.join("001.htm"), "<p>a</p>").unwrap();
        fs::write(dir.join("notes.txt"), "skip me").unwrap();

        let files = sorted_source_files(&dir).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["001.htm", "002.html", "010.html"]);
    }

    #[test]
    fn utf8_decodes_without_declaration() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.html");
        let (text, enc) = decode_text(&path, "باب الإدغام".as_bytes()).unwrap();
        assert_eq!(text, "باب الإدغام");
        assert_eq!(enc, "utf-8");
    }

    #[test]
    fn declared_cp1256_decodes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.html");
        // "باب" in windows-1256 is 0xC8 0xC7 0xC8
        let mut bytes = b"<meta charset=\"windows-1256\">".to_vec();
        bytes.extend_from_slice(&[0xc8, 0xc7, 0xc8]);
        let (text, enc) = decode_text(&path, &bytes).unwrap();
        assert!(text.contains("باب"));
        assert_eq!(enc, "windows-1256");
    }

    #[test]
    fn conflicting_declaration_fails_closed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.html");
        // Valid multibyte UTF-8 content, but the file claims cp1256.
        let mut bytes = b"<meta charset=\"windows-1256\">".to_vec();
        bytes.extend_from_slice("باب".as_bytes());
        assert!(decode_text(&path, &bytes).is_err());
    }

    #[test]
    fn undecodable_bytes_fail_closed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.html");
        assert!(decode_text(&path, &[0xff, 0xfe, 0x00, 0xff]).is_err());
    }

    #[test]
    fn manifest_digest_is_stable_and_content_sensitive() {
        let tmp = TempDir::new().unwrap();
        let dir = book_dir(&tmp, "b1");
        fs::write(dir.join("001.html"), "<p>باب الأول</p>").unwrap();
        fs::write(dir.join("002.html"), "<p>باب الثاني</p>").unwrap();

        let (sources1, _) = load_book(tmp.path(), "b1").unwrap();
        let (sources2, _) = load_book(tmp.path(), "b1").unwrap();
        assert_eq!(manifest_digest(&sources1), manifest_digest(&sources2));

        fs::write(dir.join("002.html"), "<p>باب مختلف</p>").unwrap();
        let (sources3, _) = load_book(tmp.path(), "b1").unwrap();
        assert_ne!(manifest_digest(&sources1), manifest_digest(&sources3));
    }

    #[test]
    fn run_id_uses_pinned_stamp() {
        let id = make_run_id(Some("20250101T000000Z"), &"a".repeat(64));
        assert_eq!(id, "20250101T000000Z-aaaaaaaa");
    }

    #[test]
    fn rerun_hash_mismatch_is_input_error() {
        let tmp = TempDir::new().unwrap();
        let dir = book_dir(&tmp, "b1");
        fs::write(dir.join("001.html"), "<p>x</p>").unwrap();
        let (_, before) = load_book(tmp.path(), "b1").unwrap();

        fs::write(dir.join("001.html"), "<p>y</p>").unwrap();
        let (_, after) = load_book(tmp.path(), "b1").unwrap();

        let err = verify_manifest_unchanged(&before, &after).unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
    }
}
