//! Atomic JSON/JSONL artifact I/O.
//!
//! Every run artifact is written via temp-file + rename in the destination
//! directory, so readers never observe a partial file and an interrupted run
//! can always be resumed from consistent state. JSONL lines are UTF-8 without
//! BOM, one record per line.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Serialize `payload` as pretty JSON and atomically replace `path`.
pub fn write_json<T: Serialize>(path: &Path, payload: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(payload)
        .with_context(|| format!("serializing {}", path.display()))?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// Serialize `rows` as JSONL and atomically replace `path`.
pub fn write_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut bytes = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut bytes, row)
            .with_context(|| format!("serializing row for {}", path.display()))?;
        bytes.push(b'\n');
    }
    write_atomic(path, &bytes)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut rows = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let row = serde_json::from_str(trimmed)
            .with_context(|| format!("parsing {} line {}", path.display(), lineno + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Write bytes to a sibling temp file, then rename over the destination.
/// Rename within one directory is atomic on the platforms we care about.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("no parent directory for {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating {}", parent.display()))?;

    let file_name = path
        .file_name()
        .with_context(|| format!("no file name in {}", path.display()))?
        .to_string_lossy();
    let tmp = parent.join(format!(".{file_name}.tmp"));

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(bytes)
            .with_context(|| format!("writing {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: String,
        n: u32,
    }

    #[test]
    fn json_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("out.json");
        let row = Row { id: "a".into(), n: 7 };
        write_json(&path, &row).unwrap();
        let back: Row = read_json(&path).unwrap();
        assert_eq!(back, row);
        // No temp file left behind
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn jsonl_roundtrip_skips_blank_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("rows.jsonl");
        let rows = vec![
            Row { id: "a".into(), n: 1 },
            Row { id: "b".into(), n: 2 },
        ];
        write_jsonl(&path, &rows).unwrap();

        // Inject a blank line, still parses
        let mut content = fs::read_to_string(&path).unwrap();
        content.push('\n');
        fs::write(&path, content).unwrap();
        let back: Vec<Row> = read_jsonl(&path).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn jsonl_has_no_bom() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("rows.jsonl");
        write_jsonl(&path, &[Row { id: "x".into(), n: 0 }]).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert!(!bytes.starts_with(&[0xef, 0xbb, 0xbf]));
        assert_eq!(*bytes.last().unwrap(), b'\n');
    }

    #[test]
    fn atomic_write_replaces_existing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.json");
        write_json(&path, &Row { id: "first".into(), n: 1 }).unwrap();
        write_json(&path, &Row { id: "second".into(), n: 2 }).unwrap();
        let back: Row = read_json(&path).unwrap();
        assert_eq!(back.id, "second");
    }
}
