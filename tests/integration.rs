use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ibp_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ibp");
    path
}

const PAGE_ONE: &str = "<html><head><meta charset=\"utf-8\"></head><body>\
<p>تفسير ابن كثير</p>\
<p>المؤلف: فلان الفلاني</p>\
<p>الناشر: دار النشر</p>\
<p>(ص: 1)</p>\
</body></html>";

const PAGE_TWO: &str = "<html><head><meta charset=\"utf-8\"></head><body>\
<p>تفسير ابن كثير</p>\
<center><p><b>باب الإدغام</b></p></center>\
<p>الإدغام هو إدخال حرف ساكن في حرف متحرك حتى يصيرا حرفا واحدا مشددا.</p>\
<p>وهذا الكلام يمتد ويطول في شرح المسألة بما يكفي لصفحة كاملة من المتن.</p>\
<p>(ص: 2)</p>\
</body></html>";

const PAGE_THREE: &str = "<html><head><meta charset=\"utf-8\"></head><body>\
<p>تفسير ابن كثير</p>\
<hr>\
<center><p><b>تمارين ١</b></p></center>\
<p>سؤال: ما هو الإدغام؟ أجب بتفصيل مع الأمثلة الواضحة من القرآن.</p>\
<p>(ص: 3)</p>\
</body></html>";

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let book_dir = root.join("books").join("tafsir_test");
    let source_raw = book_dir.join("source_raw");
    fs::create_dir_all(&source_raw).unwrap();
    fs::write(source_raw.join("001.html"), PAGE_ONE).unwrap();
    fs::write(source_raw.join("002.html"), PAGE_TWO).unwrap();
    fs::write(source_raw.join("003.html"), PAGE_THREE).unwrap();
    fs::write(
        book_dir.join("meta.json"),
        r#"{"science": "Tajwid", "title": "كتاب تجريبي", "author": "فلان"}"#,
    )
    .unwrap();

    let fixtures = root.join("fixtures");
    fs::create_dir_all(fixtures.join("splits")).unwrap();
    fs::write(
        fixtures.join("must_not_heading.jsonl"),
        "{\"text\": \"مسألة:\"}\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[paths]
books_root = "{root}/books"
runs_root = "{root}/runs"
corpus_root = "{root}/corpus"
cache_dir = "{root}/cache"
fixtures_root = "{root}/fixtures"
"#,
        root = root.display()
    );
    let config_path = root.join("ibp.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ibp(config_path: &Path, args: &[&str]) -> (String, String, Option<i32>) {
    let binary = ibp_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ibp binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code())
}

const RUN_ID: &str = "20250101T000000Z";

fn ingest(config_path: &Path) -> String {
    let (stdout, stderr, code) = run_ibp(
        config_path,
        &[
            "--dry-run",
            "ingest",
            "tafsir_test",
            "--run-id",
            RUN_ID,
        ],
    );
    assert_eq!(code, Some(0), "ingest failed: {stdout}\n{stderr}");
    stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix("run_id: "))
        .expect("run_id in ingest output")
        .to_string()
}

#[test]
fn ingest_emits_proposal_and_awaits_approval() {
    let (tmp, config_path) = setup_test_env();
    let run_id = ingest(&config_path);

    let run_dir = tmp.path().join("runs").join(&run_id).join("tafsir_test");
    for artifact in [
        "ingest_manifest.json",
        "book_profile.json",
        "heading_candidates.jsonl",
        "heading_decisions.jsonl",
        "heading_injections.proposed.jsonl",
        "run_report.json",
        "run_report.md",
        "run_state.json",
    ] {
        assert!(run_dir.join(artifact).exists(), "missing {artifact}");
    }

    let state = fs::read_to_string(run_dir.join("run_state.json")).unwrap();
    assert!(state.contains("AWAITING_APPROVAL"));

    // The pagehead is profiled and never proposed.
    let proposed = fs::read_to_string(run_dir.join("heading_injections.proposed.jsonl")).unwrap();
    assert!(!proposed.contains("تفسير ابن كثير"));
    assert!(proposed.contains("باب الإدغام"));
}

#[test]
fn full_pipeline_produces_canonical_chunks_and_projection() {
    let (tmp, config_path) = setup_test_env();
    let run_id = ingest(&config_path);

    let (stdout, stderr, code) = run_ibp(
        &config_path,
        &[
            "approve-headings",
            &run_id,
            "--book-id",
            "tafsir_test",
            "--approve-all",
        ],
    );
    assert_eq!(code, Some(0), "approve failed: {stdout}\n{stderr}");

    let (stdout, stderr, code) = run_ibp(
        &config_path,
        &["apply", &run_id, "--book-id", "tafsir_test"],
    );
    assert_eq!(code, Some(0), "apply failed: {stdout}\n{stderr}");
    assert!(stdout.contains("chunks planned"));

    let (stdout, stderr, code) = run_ibp(
        &config_path,
        &[
            "approve-plan",
            &run_id,
            "--book-id",
            "tafsir_test",
            "--approve-all",
        ],
    );
    assert_eq!(code, Some(0), "approve-plan failed: {stdout}\n{stderr}");

    let (stdout, stderr, code) = run_ibp(
        &config_path,
        &["commit", &run_id, "--book-id", "tafsir_test"],
    );
    assert_eq!(code, Some(0), "commit failed: {stdout}\n{stderr}");
    assert!(stdout.contains("ok"));

    // Canonical chunks exist and contain the approved heading anchor.
    let chunks_dir = tmp
        .path()
        .join("corpus")
        .join("Tajwid")
        .join("chunks_by_book")
        .join("tafsir_test");
    let chunk_files: Vec<_> = fs::read_dir(&chunks_dir).unwrap().collect();
    assert!(!chunk_files.is_empty());
    let bodies: String = fs::read_dir(&chunks_dir)
        .unwrap()
        .map(|e| fs::read_to_string(e.unwrap().path()).unwrap())
        .collect();
    assert!(bodies.contains("## باب الإدغام"));

    // The projection mirrors the canonical chunks under topics/.
    let topics_dir = tmp.path().join("corpus").join("Tajwid").join("topics");
    let topic_folders: Vec<String> = fs::read_dir(&topics_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(!topic_folders.is_empty());
    for folder in &topic_folders {
        assert!(folder.starts_with('T'), "folder {folder} lacks a topic id");
        assert!(folder.contains("__"));
    }
    // The exercises heading lands in the exercises/applications family.
    assert!(
        topic_folders.iter().any(|f| f.contains("تمارين_وتطبيقات")),
        "folders: {topic_folders:?}"
    );

    // Registry exists.
    assert!(tmp
        .path()
        .join("corpus")
        .join("Tajwid")
        .join("registry")
        .join("registry.sqlite")
        .exists());

    // Anchor-miss diagnostics exist for the front-matter file.
    let miss_dir = tmp
        .path()
        .join("corpus")
        .join("Tajwid")
        .join("_ANCHOR_MISS")
        .join("tafsir_test");
    assert!(miss_dir.exists());
}

#[test]
fn commit_is_idempotent() {
    let (tmp, config_path) = setup_test_env();
    let run_id = ingest(&config_path);
    run_ibp(
        &config_path,
        &["approve-headings", &run_id, "--book-id", "tafsir_test", "--approve-all"],
    );
    run_ibp(&config_path, &["apply", &run_id, "--book-id", "tafsir_test"]);
    run_ibp(
        &config_path,
        &["approve-plan", &run_id, "--book-id", "tafsir_test", "--approve-all"],
    );
    let (first, _, code1) = run_ibp(
        &config_path,
        &["commit", &run_id, "--book-id", "tafsir_test"],
    );
    assert_eq!(code1, Some(0), "{first}");

    let chunks_dir = tmp
        .path()
        .join("corpus")
        .join("Tajwid")
        .join("chunks_by_book")
        .join("tafsir_test");
    let before: Vec<(String, String)> = fs::read_dir(&chunks_dir)
        .unwrap()
        .map(|e| {
            let p = e.unwrap().path();
            (
                p.file_name().unwrap().to_string_lossy().into_owned(),
                fs::read_to_string(&p).unwrap(),
            )
        })
        .collect();

    // Re-committing the applied run leaves canonical chunks untouched.
    let (second, stderr, code2) = run_ibp(
        &config_path,
        &["commit", &run_id, "--book-id", "tafsir_test"],
    );
    assert_eq!(code2, Some(0), "{second}\n{stderr}");
    assert!(second.contains("registry inserts: 0"), "{second}");

    let after: Vec<(String, String)> = fs::read_dir(&chunks_dir)
        .unwrap()
        .map(|e| {
            let p = e.unwrap().path();
            (
                p.file_name().unwrap().to_string_lossy().into_owned(),
                fs::read_to_string(&p).unwrap(),
            )
        })
        .collect();
    assert_eq!(before, after);
}

#[test]
fn apply_before_approval_exits_awaiting() {
    let (_tmp, config_path) = setup_test_env();
    let run_id = ingest(&config_path);

    let (stdout, stderr, code) = run_ibp(
        &config_path,
        &["apply", &run_id, "--book-id", "tafsir_test"],
    );
    assert_eq!(code, Some(2), "expected exit 2: {stdout}\n{stderr}");
}

#[test]
fn rerun_with_pinned_run_id_is_byte_identical() {
    let (tmp, config_path) = setup_test_env();
    let run_id = ingest(&config_path);
    let run_dir = tmp.path().join("runs").join(&run_id).join("tafsir_test");

    let read_all = |dir: &Path| -> Vec<(String, Vec<u8>)> {
        let mut rows: Vec<(String, Vec<u8>)> = fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .map(|e| {
                (
                    e.file_name().to_string_lossy().into_owned(),
                    fs::read(e.path()).unwrap(),
                )
            })
            .collect();
        rows.sort();
        rows
    };

    let first = read_all(&run_dir);
    let run_id2 = ingest(&config_path);
    assert_eq!(run_id, run_id2);
    let second = read_all(&run_dir);
    assert_eq!(
        first.iter().map(|(n, _)| n).collect::<Vec<_>>(),
        second.iter().map(|(n, _)| n).collect::<Vec<_>>()
    );
    for ((name_a, bytes_a), (_, bytes_b)) in first.iter().zip(second.iter()) {
        assert_eq!(bytes_a, bytes_b, "artifact {name_a} changed between reruns");
    }
}

#[test]
fn must_not_candidate_is_blocked_in_proposal() {
    let (tmp, config_path) = setup_test_env();

    // Add a page with a candidate that matches the must-not fixture.
    let source_raw = tmp
        .path()
        .join("books")
        .join("tafsir_test")
        .join("source_raw");
    fs::write(
        source_raw.join("004.html"),
        "<html><head><meta charset=\"utf-8\"></head><body>\
        <p>تفسير ابن كثير</p>\
        <center><p><b>مسألة:</b></p></center>\
        <p>نص المسألة المذكورة في وسط الكلام بشرح طويل.</p>\
        <p>(ص: 4)</p>\
        </body></html>",
    )
    .unwrap();

    let run_id = ingest(&config_path);
    let run_dir = tmp.path().join("runs").join(&run_id).join("tafsir_test");
    let proposed = fs::read_to_string(run_dir.join("heading_injections.proposed.jsonl")).unwrap();

    let blocked_row = proposed
        .lines()
        .find(|l| l.contains("مسألة:"))
        .expect("blocked row is present, not omitted");
    assert!(blocked_row.contains("\"blocked_by_must_not_heading\":true"));

    // The report lists the block.
    let report = fs::read_to_string(run_dir.join("run_report.md")).unwrap();
    assert!(report.contains("blocked by must-not-heading"));
}

#[test]
fn clean_book_archives_previous_outputs() {
    let (tmp, config_path) = setup_test_env();
    let run_id = ingest(&config_path);
    assert!(tmp.path().join("runs").join(&run_id).exists());

    let (stdout, stderr, code) = run_ibp(&config_path, &["clean-book", "tafsir_test"]);
    assert_eq!(code, Some(0), "{stdout}\n{stderr}");

    // Run outputs moved, not deleted.
    assert!(!tmp
        .path()
        .join("runs")
        .join(&run_id)
        .join("tafsir_test")
        .exists());
    let archive = tmp
        .path()
        .join("corpus")
        .join("Tajwid")
        .join("_ARCHIVE")
        .join("tafsir_test");
    assert!(archive.exists());
}
