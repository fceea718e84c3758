//! The source-of-truth registry: topics, books, chunks, placements,
//! cross-references, and projections, in SQLite (WAL).
//!
//! # Schema
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `topics` | Taxonomy nodes with immutable `T######` identities |
//! | `topic_id_allocator` | Monotone numeric allocator; imported ids bump the floor |
//! | `books` | Ingested books and their science |
//! | `chunks` | Append-only canonical chunk records with provenance |
//! | `placements` | Placement decisions with rationale and confidence |
//! | `projections` | Materialized topic-folder links (hardlink/copy) |
//! | `xrefs` | Cross-references between chunks and topics |
//! | `schema_migrations` | Applied migration versions |
//!
//! Chunks are append-only: a new version of a span inserts a fresh row and
//! marks the prior one deprecated via an `xrefs` supersedes link — bodies are
//! never rewritten. Registry mutations happen only during the commit stage
//! and are transactional; only the projection layer touches the filesystem
//! outside these transactions.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use crate::models::{
    ChunkRecord, CreatedBy, LinkType, ProjectionRow, Science, Topic, TopicStatus,
};
use crate::placement::{PlacementProposal, TopicExemplar, TopicNode};
use crate::project::sanitize_component;

/// Exemplar body excerpt length stored for topic matching.
const EXEMPLAR_EXCERPT_CHARS: usize = 600;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_topics",
        sql: r#"
        CREATE TABLE IF NOT EXISTS topics (
            topic_id TEXT PRIMARY KEY,
            parent_topic_id TEXT,
            display_title_ar TEXT NOT NULL,
            display_title_en TEXT,
            aliases_ar_json TEXT NOT NULL DEFAULT '[]',
            aliases_en_json TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'active',
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            notes TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (parent_topic_id) REFERENCES topics(topic_id)
        );
        CREATE INDEX IF NOT EXISTS idx_topics_parent ON topics(parent_topic_id);
        "#,
    },
    Migration {
        version: 2,
        name: "create_topic_id_allocator",
        sql: r#"
        CREATE TABLE IF NOT EXISTS topic_id_allocator (
            allocator_key TEXT PRIMARY KEY,
            next_numeric_id INTEGER NOT NULL
        );
        "#,
    },
    Migration {
        version: 3,
        name: "create_books",
        sql: r#"
        CREATE TABLE IF NOT EXISTS books (
            book_id TEXT PRIMARY KEY,
            science TEXT NOT NULL,
            title TEXT NOT NULL,
            author TEXT,
            last_run_id TEXT,
            created_at TEXT NOT NULL
        );
        "#,
    },
    Migration {
        version: 4,
        name: "create_chunks",
        sql: r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            book_id TEXT NOT NULL,
            topic_id TEXT NOT NULL,
            heading TEXT NOT NULL,
            level INTEGER NOT NULL,
            body_excerpt TEXT NOT NULL,
            canonical_path TEXT NOT NULL,
            file TEXT NOT NULL,
            page INTEGER,
            dom_anchor TEXT NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            run_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (book_id) REFERENCES books(book_id),
            FOREIGN KEY (topic_id) REFERENCES topics(topic_id)
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_book ON chunks(book_id);
        CREATE INDEX IF NOT EXISTS idx_chunks_topic ON chunks(topic_id);
        CREATE INDEX IF NOT EXISTS idx_chunks_anchor ON chunks(book_id, file, dom_anchor);
        "#,
    },
    Migration {
        version: 5,
        name: "create_placements",
        sql: r#"
        CREATE TABLE IF NOT EXISTS placements (
            placement_id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            chosen_topic_id TEXT,
            status TEXT NOT NULL,
            rationale_json TEXT NOT NULL,
            boundary_confidence REAL NOT NULL,
            topic_purity_confidence REAL NOT NULL,
            placement_confidence REAL NOT NULL,
            reviewer TEXT NOT NULL,
            decided_at TEXT NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(chunk_id)
        );
        CREATE INDEX IF NOT EXISTS idx_placements_run ON placements(run_id);
        "#,
    },
    Migration {
        version: 6,
        name: "create_projections",
        sql: r#"
        CREATE TABLE IF NOT EXISTS projections (
            projection_id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic_id TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            canonical_path TEXT NOT NULL,
            projected_path TEXT NOT NULL,
            link_type TEXT NOT NULL,
            run_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(topic_id, chunk_id, projected_path),
            FOREIGN KEY (topic_id) REFERENCES topics(topic_id),
            FOREIGN KEY (chunk_id) REFERENCES chunks(chunk_id)
        );
        "#,
    },
    Migration {
        version: 7,
        name: "create_xrefs",
        sql: r#"
        CREATE TABLE IF NOT EXISTS xrefs (
            xref_id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_chunk_id TEXT NOT NULL,
            to_chunk_id TEXT,
            to_topic_id TEXT,
            kind TEXT NOT NULL,
            reason TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_xrefs_from ON xrefs(from_chunk_id);
        "#,
    },
];

/// Statistics the commit stage reports back.
#[derive(Debug, Clone, Default)]
pub struct CommitStats {
    pub chunks_inserted: usize,
    pub chunks_already_present: usize,
    pub chunks_deprecated: usize,
    pub topics_created: usize,
}

pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    /// Open (creating if needed) the registry under `registry_dir`.
    pub async fn open(registry_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(registry_dir)?;
        let db_path = registry_dir.join("registry.sqlite");
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let registry = Self { pool };
        registry.migrate().await?;
        Ok(registry)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_migrations")
            .fetch_all(&self.pool)
            .await?;

        for migration in MIGRATIONS {
            if applied.contains(&migration.version) {
                continue;
            }
            // Each migration may hold several statements.
            for statement in migration
                .sql
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
            {
                sqlx::query(statement).execute(&self.pool).await?;
            }
            sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
                .bind(migration.version)
                .bind(migration.name)
                .bind(chrono::Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub async fn upsert_book(
        &self,
        book_id: &str,
        science: Science,
        title: &str,
        author: Option<&str>,
        run_id: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO books (book_id, science, title, author, last_run_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(book_id) DO UPDATE SET
                science = excluded.science,
                title = excluded.title,
                author = excluded.author,
                last_run_id = excluded.last_run_id
            "#,
        )
        .bind(book_id)
        .bind(science.to_string())
        .bind(title)
        .bind(author)
        .bind(run_id)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All active topics with exemplars drawn from their committed chunks,
    /// for the placement planner. Folder names play no part here.
    pub async fn topics_for_matching(&self) -> Result<Vec<TopicNode>> {
        let topic_rows = sqlx::query(
            "SELECT topic_id, display_title_ar FROM topics WHERE status = 'active' ORDER BY topic_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut nodes = Vec::with_capacity(topic_rows.len());
        for row in topic_rows {
            let topic_id: String = row.get("topic_id");
            let title: String = row.get("display_title_ar");
            let exemplar_rows = sqlx::query(
                r#"
                SELECT heading, body_excerpt FROM chunks
                WHERE topic_id = ? AND status = 'active'
                ORDER BY created_at DESC, chunk_id
                LIMIT 5
                "#,
            )
            .bind(&topic_id)
            .fetch_all(&self.pool)
            .await?;
            let exemplars = exemplar_rows
                .into_iter()
                .map(|r| TopicExemplar {
                    heading: r.get("heading"),
                    body: r.get("body_excerpt"),
                })
                .collect();
            nodes.push(TopicNode {
                topic_id,
                title,
                exemplars,
            });
        }
        Ok(nodes)
    }

    /// Find an active topic whose display title matches exactly (after path
    /// sanitization both ways, since titles round-trip through folders).
    pub async fn find_topic_by_title(&self, title: &str) -> Result<Option<String>> {
        let sanitized = sanitize_component(title);
        let rows = sqlx::query("SELECT topic_id, display_title_ar FROM topics WHERE status = 'active'")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let existing: String = row.get("display_title_ar");
            if existing == title || sanitize_component(&existing) == sanitized {
                return Ok(Some(row.get("topic_id")));
            }
        }
        Ok(None)
    }

    /// Commit the approved chunk plan in one transaction: topics are created
    /// or resolved, chunk rows inserted (append-only, idempotent), superseded
    /// spans deprecated, and placement decisions recorded.
    ///
    /// Returns per-chunk topic assignments for the projection layer.
    pub async fn commit_plan(
        &self,
        run_id: &str,
        items: &[(ChunkRecord, PlacementProposal, String)],
    ) -> Result<(CommitStats, Vec<(String, String)>)> {
        let mut tx = self.pool.begin().await?;
        let mut stats = CommitStats::default();
        let mut assignments: Vec<(String, String)> = Vec::with_capacity(items.len());
        let now = chrono::Utc::now().to_rfc3339();

        for (chunk, placement, canonical_path) in items {
            // Resolve the topic inside the transaction.
            let topic_id = match &placement.chosen_topic_id {
                Some(id) => id.clone(),
                None => {
                    let title = placement
                        .proposed_new_topic_title
                        .clone()
                        .unwrap_or_else(|| chunk.heading.clone());
                    let existing = find_topic_by_title_tx(&mut tx, &title).await?;
                    match existing {
                        Some(id) => id,
                        None => {
                            let id = allocate_topic_id_tx(&mut tx).await?;
                            sqlx::query(
                                r#"
                                INSERT INTO topics (topic_id, parent_topic_id, display_title_ar,
                                    status, created_by, created_at, notes)
                                VALUES (?, NULL, ?, 'active', 'rule', ?, '')
                                "#,
                            )
                            .bind(&id)
                            .bind(&title)
                            .bind(&now)
                            .execute(&mut *tx)
                            .await?;
                            stats.topics_created += 1;
                            id
                        }
                    }
                }
            };

            // Append-only chunk insert; reruns of an applied plan are no-ops.
            let exists: Option<String> =
                sqlx::query_scalar("SELECT chunk_id FROM chunks WHERE chunk_id = ?")
                    .bind(&chunk.chunk_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if exists.is_some() {
                stats.chunks_already_present += 1;
                assignments.push((chunk.chunk_id.clone(), topic_id));
                continue;
            }

            // Supersede any prior active chunk covering the same anchor.
            let prior: Option<String> = sqlx::query_scalar(
                r#"
                SELECT chunk_id FROM chunks
                WHERE book_id = ? AND file = ? AND dom_anchor = ? AND status = 'active'
                "#,
            )
            .bind(&chunk.book_id)
            .bind(&chunk.provenance.file)
            .bind(&chunk.provenance.dom_anchor)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(prior_id) = &prior {
                sqlx::query("UPDATE chunks SET status = 'deprecated' WHERE chunk_id = ?")
                    .bind(prior_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(
                    r#"
                    INSERT INTO xrefs (from_chunk_id, to_chunk_id, kind, reason, created_at)
                    VALUES (?, ?, 'supersedes', 'canonical_replacement', ?)
                    "#,
                )
                .bind(&chunk.chunk_id)
                .bind(prior_id)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                stats.chunks_deprecated += 1;
            }

            let excerpt: String = chunk.body.chars().take(EXEMPLAR_EXCERPT_CHARS).collect();
            sqlx::query(
                r#"
                INSERT INTO chunks (chunk_id, book_id, topic_id, heading, level, body_excerpt,
                    canonical_path, file, page, dom_anchor, start_offset, end_offset,
                    status, run_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)
                "#,
            )
            .bind(&chunk.chunk_id)
            .bind(&chunk.book_id)
            .bind(&topic_id)
            .bind(&chunk.heading)
            .bind(chunk.level as i64)
            .bind(excerpt)
            .bind(canonical_path)
            .bind(&chunk.provenance.file)
            .bind(chunk.provenance.page.map(|p| p as i64))
            .bind(&chunk.provenance.dom_anchor)
            .bind(chunk.provenance.start_offset as i64)
            .bind(chunk.provenance.end_offset as i64)
            .bind(run_id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            stats.chunks_inserted += 1;

            sqlx::query(
                r#"
                INSERT INTO placements (run_id, chunk_id, chosen_topic_id, status, rationale_json,
                    boundary_confidence, topic_purity_confidence, placement_confidence,
                    reviewer, decided_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'system_commit', ?)
                "#,
            )
            .bind(run_id)
            .bind(&chunk.chunk_id)
            .bind(&topic_id)
            .bind(&placement.status)
            .bind(serde_json::to_string(&placement.reasons)?)
            .bind(placement.boundary_confidence)
            .bind(placement.topic_purity_confidence)
            .bind(placement.placement_confidence)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

            if placement.exercise_family {
                sqlx::query(
                    r#"
                    INSERT INTO xrefs (from_chunk_id, to_topic_id, kind, reason, created_at)
                    VALUES (?, ?, 'topic_family', 'exercise_family_default', ?)
                    "#,
                )
                .bind(&chunk.chunk_id)
                .bind(&topic_id)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            }

            assignments.push((chunk.chunk_id.clone(), topic_id));
        }

        tx.commit().await?;
        Ok((stats, assignments))
    }

    /// Record materialized projection links (after the filesystem pass).
    pub async fn record_projections(&self, run_id: &str, rows: &[ProjectionRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = chrono::Utc::now().to_rfc3339();
        for row in rows {
            let link = match row.link_type {
                LinkType::Hardlink => "hardlink",
                LinkType::Copy => "copy",
            };
            sqlx::query(
                r#"
                INSERT INTO projections (topic_id, chunk_id, canonical_path, projected_path,
                    link_type, run_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(topic_id, chunk_id, projected_path) DO UPDATE SET
                    link_type = excluded.link_type,
                    run_id = excluded.run_id
                "#,
            )
            .bind(&row.topic_id)
            .bind(&row.chunk_id)
            .bind(&row.canonical_path)
            .bind(&row.projected_path)
            .bind(link)
            .bind(run_id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Topic display title, for folder naming at projection time.
    pub async fn topic_title(&self, topic_id: &str) -> Result<String> {
        let title: String =
            sqlx::query_scalar("SELECT display_title_ar FROM topics WHERE topic_id = ?")
                .bind(topic_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(title)
    }

    /// Export all topics as records, and mirror them to `topics.json` in the
    /// registry directory for external inspectors.
    pub async fn export_topics(&self, registry_dir: &Path) -> Result<Vec<Topic>> {
        let rows = sqlx::query(
            r#"
            SELECT topic_id, parent_topic_id, display_title_ar, display_title_en,
                   aliases_ar_json, aliases_en_json, status, created_by, created_at, notes
            FROM topics
            ORDER BY topic_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut topics = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            let created_by: String = row.get("created_by");
            let aliases_ar: Vec<String> =
                serde_json::from_str(row.get::<String, _>("aliases_ar_json").as_str())
                    .unwrap_or_default();
            let aliases_en: Vec<String> =
                serde_json::from_str(row.get::<String, _>("aliases_en_json").as_str())
                    .unwrap_or_default();
            topics.push(Topic {
                topic_id: row.get("topic_id"),
                parent_topic_id: row.get("parent_topic_id"),
                display_title_ar: row.get("display_title_ar"),
                display_title_en: row.get("display_title_en"),
                aliases_ar,
                aliases_en,
                status: match status.as_str() {
                    "merged" => TopicStatus::Merged,
                    "deprecated" => TopicStatus::Deprecated,
                    _ => TopicStatus::Active,
                },
                created_by: match created_by.as_str() {
                    "oracle" => CreatedBy::Oracle,
                    "human" => CreatedBy::Human,
                    _ => CreatedBy::Rule,
                },
                created_at: row.get("created_at"),
                notes: row.get("notes"),
            });
        }

        crate::artifacts::write_json(
            &registry_dir.join("topics.json"),
            &serde_json::json!({ "topics": topics }),
        )?;
        Ok(topics)
    }

    pub async fn chunk_count(&self, book_id: &str) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE book_id = ?")
            .bind(book_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

async fn find_topic_by_title_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    title: &str,
) -> Result<Option<String>> {
    let sanitized = sanitize_component(title);
    let rows = sqlx::query("SELECT topic_id, display_title_ar FROM topics WHERE status = 'active'")
        .fetch_all(&mut **tx)
        .await?;
    for row in rows {
        let existing: String = row.get("display_title_ar");
        if existing == title || sanitize_component(&existing) == sanitized {
            return Ok(Some(row.get("topic_id")));
        }
    }
    Ok(None)
}

/// Allocate the next `T######`. Identifiers are never reissued: imported
/// topics with explicit ids bump the allocator floor at seed time.
async fn allocate_topic_id_tx(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<String> {
    let current: Option<i64> = sqlx::query_scalar(
        "SELECT next_numeric_id FROM topic_id_allocator WHERE allocator_key = 'topic'",
    )
    .fetch_optional(&mut **tx)
    .await?;

    let next = match current {
        Some(n) => n,
        None => {
            // Seed from the highest existing T###### id.
            let max_existing: Option<String> = sqlx::query_scalar(
                r#"
                SELECT topic_id FROM topics
                WHERE topic_id GLOB 'T[0-9][0-9][0-9][0-9][0-9][0-9]'
                ORDER BY topic_id DESC
                LIMIT 1
                "#,
            )
            .fetch_optional(&mut **tx)
            .await?;
            let seed = max_existing
                .and_then(|id| id[1..].parse::<i64>().ok())
                .map(|n| n + 1)
                .unwrap_or(1);
            sqlx::query(
                "INSERT INTO topic_id_allocator (allocator_key, next_numeric_id) VALUES ('topic', ?)",
            )
            .bind(seed)
            .execute(&mut **tx)
            .await?;
            seed
        }
    };

    sqlx::query("UPDATE topic_id_allocator SET next_numeric_id = ? WHERE allocator_key = 'topic'")
        .bind(next + 1)
        .execute(&mut **tx)
        .await?;
    Ok(format!("T{next:06}"))
}
