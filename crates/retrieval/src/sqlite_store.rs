//! SQLite retrieval backend.
//!
//! Schema: `index_meta` (one row per domain, digest-keyed), `chunks`
//! (rowid-addressed chunk text + embedding JSON), and the FTS5 virtual
//! table `chunks_fts` sharing rowids with `chunks`. Connections are opened
//! per operation in WAL mode; writers serialize on the per-db path lock.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};

use warren_domain::stream::RetrievalHit;
use warren_domain::{Error, Result};
use warren_storage::{now_ms, PathLocks};

use crate::embedding::cosine_similarity;
use crate::json_store::JsonIndex;
use crate::IndexedChunk;

pub const SCHEMA_VERSION: i64 = 1;

#[derive(Clone, Debug, PartialEq)]
pub struct IndexMeta {
    pub domain: String,
    pub digest: String,
    pub chunk_size: i64,
    pub chunk_overlap: i64,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub updated_ms: i64,
    pub schema_version: i64,
}

struct CandidateRow {
    source: String,
    text: String,
    embedding_json: String,
}

pub struct SqliteStore {
    db_file: PathBuf,
}

impl SqliteStore {
    /// Open (and create) the database under the workspace root. Relative
    /// `db_path` values resolve against `root_dir`.
    pub fn open(root_dir: &Path, db_path: &str) -> Result<Self> {
        let raw = Path::new(db_path);
        let db_file = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            root_dir.join(raw)
        };
        let store = Self { db_file };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_file).map_err(sql_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(30))
            .map_err(sql_err)?;
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(sql_err)?;
        conn.execute_batch("PRAGMA synchronous=NORMAL").map_err(sql_err)?;
        Ok(conn)
    }

    fn ensure_schema(&self) -> Result<()> {
        let lock = PathLocks::lock_for(&self.db_file);
        let _guard = lock.lock();
        if let Some(parent) = self.db_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS index_meta (
                 domain TEXT PRIMARY KEY,
                 digest TEXT NOT NULL,
                 chunk_size INTEGER NOT NULL,
                 chunk_overlap INTEGER NOT NULL,
                 embedding_provider TEXT NOT NULL,
                 embedding_model TEXT NOT NULL,
                 updated_ms INTEGER NOT NULL,
                 schema_version INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS chunks (
                 id INTEGER PRIMARY KEY,
                 domain TEXT NOT NULL,
                 source TEXT NOT NULL,
                 chunk_text TEXT NOT NULL,
                 embedding_json TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_chunks_domain ON chunks(domain);
             CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(chunk_text);",
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn get_meta(&self, domain: &str) -> Result<Option<IndexMeta>> {
        let lock = PathLocks::lock_for(&self.db_file);
        let _guard = lock.lock();
        let conn = self.connect()?;
        conn.query_row(
            "SELECT domain, digest, chunk_size, chunk_overlap, embedding_provider,
                    embedding_model, updated_ms, schema_version
             FROM index_meta WHERE domain = ?1",
            params![domain],
            |row| {
                Ok(IndexMeta {
                    domain: row.get(0)?,
                    digest: row.get(1)?,
                    chunk_size: row.get(2)?,
                    chunk_overlap: row.get(3)?,
                    embedding_provider: row.get(4)?,
                    embedding_model: row.get(5)?,
                    updated_ms: row.get(6)?,
                    schema_version: row.get(7)?,
                })
            },
        )
        .optional()
        .map_err(sql_err)
    }

    /// Atomically replace a domain's rows and upsert its meta entry:
    /// delete-rows-then-insert inside one transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn replace_domain_index(
        &self,
        domain: &str,
        digest: &str,
        chunk_size: usize,
        chunk_overlap: usize,
        embedding_provider: &str,
        embedding_model: &str,
        chunks: &[IndexedChunk],
    ) -> Result<()> {
        let lock = PathLocks::lock_for(&self.db_file);
        let _guard = lock.lock();
        let mut conn = self.connect()?;
        let tx = conn.transaction().map_err(sql_err)?;

        {
            let mut select = tx
                .prepare("SELECT id FROM chunks WHERE domain = ?1")
                .map_err(sql_err)?;
            let ids: Vec<i64> = select
                .query_map(params![domain], |row| row.get(0))
                .map_err(sql_err)?
                .filter_map(|r| r.ok())
                .collect();
            drop(select);
            for chunk_id in ids {
                tx.execute("DELETE FROM chunks_fts WHERE rowid = ?1", params![chunk_id])
                    .map_err(sql_err)?;
            }
            tx.execute("DELETE FROM chunks WHERE domain = ?1", params![domain])
                .map_err(sql_err)?;

            for chunk in chunks {
                let embedding_json =
                    serde_json::to_string(&chunk.embedding).unwrap_or_else(|_| "[]".into());
                tx.execute(
                    "INSERT INTO chunks(domain, source, chunk_text, embedding_json)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![domain, chunk.source, chunk.text, embedding_json],
                )
                .map_err(sql_err)?;
                let row_id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO chunks_fts(rowid, chunk_text) VALUES (?1, ?2)",
                    params![row_id, chunk.text],
                )
                .map_err(sql_err)?;
            }

            tx.execute(
                "INSERT INTO index_meta(domain, digest, chunk_size, chunk_overlap,
                                        embedding_provider, embedding_model, updated_ms, schema_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(domain) DO UPDATE SET
                     digest=excluded.digest,
                     chunk_size=excluded.chunk_size,
                     chunk_overlap=excluded.chunk_overlap,
                     embedding_provider=excluded.embedding_provider,
                     embedding_model=excluded.embedding_model,
                     updated_ms=excluded.updated_ms,
                     schema_version=excluded.schema_version",
                params![
                    domain,
                    digest,
                    chunk_size as i64,
                    chunk_overlap as i64,
                    embedding_provider,
                    embedding_model,
                    now_ms(),
                    SCHEMA_VERSION
                ],
            )
            .map_err(sql_err)?;
        }

        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    /// Import a legacy JSON index for a domain, preserving embeddings and
    /// stamping its digest so the caller skips a rebuild.
    pub fn import_json_index(
        &self,
        domain: &str,
        index: &JsonIndex,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Result<()> {
        self.replace_domain_index(
            domain,
            &index.digest,
            chunk_size,
            chunk_overlap,
            &index.embedding_provider,
            &index.embedding_model,
            &index.chunks,
        )
    }

    // ── Query side ──────────────────────────────────────────────────

    /// Build an FTS5 OR-query of quoted lowercase tokens (deduped, ≤24).
    fn fts_query(query: &str) -> String {
        static TOKEN: OnceLock<Regex> = OnceLock::new();
        let token = TOKEN.get_or_init(|| Regex::new(r"[A-Za-z0-9_]+").expect("static regex"));
        let mut seen = std::collections::HashSet::new();
        let mut parts = Vec::new();
        for m in token.find_iter(query).take(24) {
            let lowered = m.as_str().to_lowercase();
            if seen.insert(lowered.clone()) {
                parts.push(format!("\"{lowered}\""));
            }
        }
        parts.join(" OR ")
    }

    fn candidate_rows(&self, domain: &str, query: &str, limit: usize) -> Result<Vec<CandidateRow>> {
        let max_rows = limit.max(1) as i64;
        let fts_query = Self::fts_query(query);
        let lock = PathLocks::lock_for(&self.db_file);
        let _guard = lock.lock();
        let conn = self.connect()?;

        if !fts_query.is_empty() {
            let matched = conn
                .prepare(
                    "SELECT c.id, c.source, c.chunk_text, c.embedding_json, bm25(chunks_fts) AS rank
                     FROM chunks_fts
                     JOIN chunks c ON c.id = chunks_fts.rowid
                     WHERE c.domain = ?1 AND chunks_fts MATCH ?2
                     ORDER BY rank
                     LIMIT ?3",
                )
                .and_then(|mut stmt| {
                    stmt.query_map(params![domain, fts_query, max_rows], |row| {
                        Ok(CandidateRow {
                            source: row.get(1)?,
                            text: row.get(2)?,
                            embedding_json: row.get(3)?,
                        })
                    })
                    .map(|rows| rows.filter_map(|r| r.ok()).collect::<Vec<_>>())
                });
            match matched {
                Ok(rows) if !rows.is_empty() => return Ok(rows),
                Ok(_) => {}
                // A malformed MATCH expression falls through to recency.
                Err(e) => tracing::debug!(error = %e, "FTS query failed, using recency fallback"),
            }
        }

        let mut stmt = conn
            .prepare(
                "SELECT id, source, chunk_text, embedding_json
                 FROM chunks WHERE domain = ?1
                 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![domain, max_rows], |row| {
                Ok(CandidateRow {
                    source: row.get(1)?,
                    text: row.get(2)?,
                    embedding_json: row.get(3)?,
                })
            })
            .map_err(sql_err)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Hybrid-scored retrieval over the FTS prefilter candidates.
    #[allow(clippy::too_many_arguments)]
    pub fn retrieve(
        &self,
        domain: &str,
        query: &str,
        top_k: usize,
        fts_prefilter_k: usize,
        semantic_weight: f64,
        lexical_weight: f64,
        query_embedding: &[f32],
    ) -> Result<Vec<RetrievalHit>> {
        let rows = self.candidate_rows(domain, query, top_k.max(fts_prefilter_k))?;
        let terms: std::collections::HashSet<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let mut scored: Vec<RetrievalHit> = rows
            .into_iter()
            .filter_map(|row| {
                let lower = row.text.to_lowercase();
                let lexical = terms.iter().filter(|t| lower.contains(*t)).count() as f64;
                let semantic = if query_embedding.is_empty() {
                    0.0
                } else {
                    let embedding: Vec<f32> =
                        serde_json::from_str(&row.embedding_json).unwrap_or_default();
                    cosine_similarity(query_embedding, &embedding)
                };
                let score = semantic * semantic_weight + lexical * lexical_weight;
                (score > 0.0).then_some(RetrievalHit {
                    text: row.text,
                    score,
                    source: row.source,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k.max(1));
        Ok(scored)
    }
}

fn sql_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunks() -> Vec<IndexedChunk> {
        vec![
            IndexedChunk {
                source: "memory/MEMORY.md".into(),
                text: "the capybara prefers rivers".into(),
                embedding: vec![1.0, 0.0],
            },
            IndexedChunk {
                source: "memory/MEMORY.md".into(),
                text: "rust services use tokio".into(),
                embedding: vec![0.0, 1.0],
            },
        ]
    }

    fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path(), "storage/retrieval.db").unwrap();
        (dir, store)
    }

    #[test]
    fn replace_and_meta_round_trip() {
        let (_dir, store) = open_store();
        store
            .replace_domain_index("memory", "d1", 256, 32, "openai", "m", &sample_chunks())
            .unwrap();
        let meta = store.get_meta("memory").unwrap().unwrap();
        assert_eq!(meta.digest, "d1");
        assert_eq!(meta.chunk_size, 256);
        assert_eq!(meta.schema_version, SCHEMA_VERSION);
        assert!(store.get_meta("knowledge").unwrap().is_none());
    }

    #[test]
    fn rebuild_is_idempotent_on_rows() {
        let (_dir, store) = open_store();
        for _ in 0..2 {
            store
                .replace_domain_index("memory", "d1", 256, 32, "openai", "m", &sample_chunks())
                .unwrap();
        }
        let hits = store
            .retrieve("memory", "tokio", 10, 10, 0.0, 1.0, &[])
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn fts_prefilter_finds_lexical_matches() {
        let (_dir, store) = open_store();
        store
            .replace_domain_index("memory", "d1", 256, 32, "openai", "m", &sample_chunks())
            .unwrap();
        let hits = store
            .retrieve("memory", "capybara rivers", 3, 20, 0.7, 0.3, &[])
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("capybara"));
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn semantic_scoring_uses_query_embedding() {
        let (_dir, store) = open_store();
        store
            .replace_domain_index("memory", "d1", 256, 32, "openai", "m", &sample_chunks())
            .unwrap();
        // Query shares no tokens with the chunks, so candidates come from
        // the recency fallback and semantic weight decides the order.
        let hits = store
            .retrieve("memory", "zzz", 2, 20, 1.0, 0.0, &[0.0, 1.0])
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("tokio"));
    }

    #[test]
    fn fts_query_dedupes_and_quotes_tokens() {
        let q = SqliteStore::fts_query("Hello hello, WORLD! 42");
        assert_eq!(q, "\"hello\" OR \"world\" OR \"42\"");
    }

    #[test]
    fn zero_score_rows_are_discarded() {
        let (_dir, store) = open_store();
        store
            .replace_domain_index("memory", "d1", 256, 32, "openai", "m", &sample_chunks())
            .unwrap();
        let hits = store
            .retrieve("memory", "nomatchterm", 5, 20, 0.7, 0.3, &[])
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn json_import_preserves_digest_and_embeddings() {
        let (_dir, store) = open_store();
        let index = JsonIndex::new(
            "legacy-digest".into(),
            "openai",
            "m",
            String::new(),
            sample_chunks(),
        );
        store.import_json_index("memory", &index, 256, 32).unwrap();
        let meta = store.get_meta("memory").unwrap().unwrap();
        assert_eq!(meta.digest, "legacy-digest");
        let hits = store
            .retrieve("memory", "capybara", 3, 20, 0.5, 0.5, &[1.0, 0.0])
            .unwrap();
        assert!(!hits.is_empty());
    }
}
