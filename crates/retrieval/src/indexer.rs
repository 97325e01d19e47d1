//! Per-domain index orchestration: digest computation, rebuild-on-mismatch,
//! backend selection, legacy migration, and the hybrid retrieval entry
//! point.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use sha2::{Digest as _, Sha256};

use warren_domain::config::{RetrievalDomainConfig, RetrievalEngine, RetrievalStorageConfig};
use warren_domain::stream::RetrievalHit;
use warren_domain::Result;

use crate::chunk::chunk;
use crate::embedding::{cosine_similarity, Embedder};
use crate::json_store::{self, JsonIndex};
use crate::sqlite_store::SqliteStore;
use crate::IndexedChunk;

/// The two indexed corpora of a workspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Domain {
    Memory,
    Knowledge,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Memory => "memory",
            Domain::Knowledge => "knowledge",
        }
    }

    fn json_index_file(&self, root_dir: &Path) -> PathBuf {
        let dir = match self {
            Domain::Memory => "memory_index",
            Domain::Knowledge => "knowledge_index",
        };
        root_dir.join("storage").join(dir).join("index.json")
    }
}

pub struct RetrievalIndex {
    root_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
}

impl RetrievalIndex {
    pub fn new(root_dir: &Path, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            root_dir: root_dir.to_path_buf(),
            embedder,
        }
    }

    // ── Sources ─────────────────────────────────────────────────────

    fn memory_file(&self) -> PathBuf {
        self.root_dir.join("memory").join("MEMORY.md")
    }

    fn knowledge_files(&self) -> Vec<PathBuf> {
        fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, out);
                } else if path.is_file() {
                    out.push(path);
                }
            }
        }
        let mut files = Vec::new();
        walk(&self.root_dir.join("knowledge"), &mut files);
        files.sort();
        files
    }

    fn sources(&self, domain: Domain) -> Vec<(String, String)> {
        match domain {
            Domain::Memory => {
                let text = std::fs::read_to_string(self.memory_file()).unwrap_or_default();
                vec![("memory/MEMORY.md".to_string(), text)]
            }
            Domain::Knowledge => self
                .knowledge_files()
                .into_iter()
                .filter_map(|path| {
                    let rel = path
                        .strip_prefix(&self.root_dir)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .replace('\\', "/");
                    std::fs::read(&path)
                        .ok()
                        .map(|bytes| (rel, String::from_utf8_lossy(&bytes).into_owned()))
                })
                .collect(),
        }
    }

    // ── Digests ─────────────────────────────────────────────────────

    /// The cache key for a domain index: content identity ⊕ chunk params.
    pub fn digest(&self, domain: Domain, settings: &RetrievalDomainConfig) -> String {
        match domain {
            Domain::Memory => {
                let text = std::fs::read_to_string(self.memory_file()).unwrap_or_default();
                let content_hash = hex::encode(Sha256::digest(text.as_bytes()));
                let payload = json!({
                    "content_hash": content_hash,
                    "chunk_size": settings.chunk_size,
                    "chunk_overlap": settings.chunk_overlap,
                });
                hex::encode(Sha256::digest(
                    warren_domain::config::canonical_json(&payload).as_bytes(),
                ))
            }
            Domain::Knowledge => {
                let mut hasher = Sha256::new();
                for path in self.knowledge_files() {
                    let rel = path
                        .strip_prefix(&self.root_dir)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .replace('\\', "/");
                    hasher.update(rel.as_bytes());
                    if let Ok(meta) = std::fs::metadata(&path) {
                        let mtime_ns = meta
                            .modified()
                            .ok()
                            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                            .map(|d| d.as_nanos())
                            .unwrap_or(0);
                        hasher.update(mtime_ns.to_string().as_bytes());
                        hasher.update(meta.len().to_string().as_bytes());
                    }
                }
                hasher.update(settings.chunk_size.to_string().as_bytes());
                hasher.update(settings.chunk_overlap.to_string().as_bytes());
                hex::encode(hasher.finalize())
            }
        }
    }

    // ── Rebuild ─────────────────────────────────────────────────────

    /// Chunk, embed, and replace the domain index in the active backend.
    /// Embedding failures leave empty vectors and a recorded error string.
    pub async fn rebuild(
        &self,
        domain: Domain,
        settings: &RetrievalDomainConfig,
        storage: &RetrievalStorageConfig,
    ) -> Result<()> {
        let digest = self.digest(domain, settings);
        let mut chunks: Vec<IndexedChunk> = Vec::new();
        for (source, text) in self.sources(domain) {
            for piece in chunk(&text, settings.chunk_size, settings.chunk_overlap) {
                chunks.push(IndexedChunk {
                    source: source.clone(),
                    text: piece,
                    embedding: Vec::new(),
                });
            }
        }

        let mut embedding_error = String::new();
        if !chunks.is_empty() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            match self.embedder.embed_texts(&texts).await {
                Ok(vectors) => {
                    for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                        chunk.embedding = vector;
                    }
                }
                Err(e) => {
                    embedding_error = e.to_string();
                    tracing::warn!(
                        domain = domain.as_str(),
                        error = %embedding_error,
                        "embedding failed, indexing without vectors"
                    );
                }
            }
        }

        let index = JsonIndex::new(
            digest.clone(),
            self.embedder.provider(),
            self.embedder.model(),
            embedding_error,
            chunks,
        );
        // The JSON index is always refreshed: it is the fallback scan target
        // even when SQLite is the primary engine.
        json_store::save(&domain.json_index_file(&self.root_dir), &index)?;

        if storage.engine == RetrievalEngine::Sqlite {
            let store = SqliteStore::open(&self.root_dir, &storage.db_path)?;
            store.replace_domain_index(
                domain.as_str(),
                &digest,
                settings.chunk_size,
                settings.chunk_overlap,
                self.embedder.provider(),
                self.embedder.model(),
                &index.chunks,
            )?;
        }
        tracing::debug!(domain = domain.as_str(), chunks = index.chunks.len(), "index rebuilt");
        Ok(())
    }

    /// Make sure the stored index matches the current digest, migrating a
    /// legacy JSON index into SQLite on first access.
    async fn ensure_fresh(
        &self,
        domain: Domain,
        settings: &RetrievalDomainConfig,
        storage: &RetrievalStorageConfig,
    ) -> Result<()> {
        let digest = self.digest(domain, settings);
        match storage.engine {
            RetrievalEngine::Sqlite => {
                let store = SqliteStore::open(&self.root_dir, &storage.db_path)?;
                let meta = store.get_meta(domain.as_str())?;
                if meta.is_none() {
                    if let Some(legacy) = json_store::load(&domain.json_index_file(&self.root_dir))
                    {
                        if let Err(e) = store.import_json_index(
                            domain.as_str(),
                            &legacy,
                            settings.chunk_size,
                            settings.chunk_overlap,
                        ) {
                            tracing::warn!(error = %e, "legacy index import failed, rebuilding");
                        }
                    }
                }
                let current = store.get_meta(domain.as_str())?;
                if current.map(|m| m.digest) != Some(digest) {
                    self.rebuild(domain, settings, storage).await?;
                }
            }
            RetrievalEngine::Json => {
                let stale = json_store::load(&domain.json_index_file(&self.root_dir))
                    .map(|index| index.digest != digest)
                    .unwrap_or(true);
                if stale {
                    self.rebuild(domain, settings, storage).await?;
                }
            }
        }
        Ok(())
    }

    // ── Retrieval ───────────────────────────────────────────────────

    fn score_json_chunks(
        index: &JsonIndex,
        query: &str,
        query_embedding: &[f32],
        settings: &RetrievalDomainConfig,
        top_k: usize,
    ) -> Vec<RetrievalHit> {
        let terms: HashSet<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let mut scored: Vec<RetrievalHit> = index
            .chunks
            .iter()
            .filter_map(|chunk| {
                let lower = chunk.text.to_lowercase();
                let lexical = terms.iter().filter(|t| lower.contains(*t)).count() as f64;
                let semantic = if query_embedding.is_empty() || chunk.embedding.is_empty() {
                    0.0
                } else {
                    cosine_similarity(query_embedding, &chunk.embedding)
                };
                let score =
                    semantic * settings.semantic_weight + lexical * settings.lexical_weight;
                (score > 0.0).then(|| RetrievalHit {
                    text: chunk.text.clone(),
                    score,
                    source: chunk.source.clone(),
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k.max(1));
        scored
    }

    /// Answer a hybrid-scored query against a domain, rebuilding first when
    /// the digest is stale. Never fails the caller: any backend error
    /// degrades to an empty result set.
    pub async fn retrieve(
        &self,
        domain: Domain,
        query: &str,
        top_k: usize,
        settings: &RetrievalDomainConfig,
        storage: &RetrievalStorageConfig,
    ) -> Vec<RetrievalHit> {
        if let Err(e) = self.ensure_fresh(domain, settings, storage).await {
            tracing::warn!(domain = domain.as_str(), error = %e, "index refresh failed");
        }

        let query_embedding = match self.embedder.embed_texts(&[query.to_string()]).await {
            Ok(mut vectors) => vectors.pop().unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        let top_k = top_k.max(1);

        if storage.engine == RetrievalEngine::Sqlite {
            let hits = SqliteStore::open(&self.root_dir, &storage.db_path)
                .and_then(|store| {
                    store.retrieve(
                        domain.as_str(),
                        query,
                        top_k,
                        storage.fts_prefilter_k,
                        settings.semantic_weight,
                        settings.lexical_weight,
                        &query_embedding,
                    )
                })
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "sqlite retrieval failed");
                    Vec::new()
                });
            if !hits.is_empty() {
                return hits;
            }
            // Small or uninitialized corpora: scan the JSON index directly.
        }

        json_store::load(&domain.json_index_file(&self.root_dir))
            .map(|index| Self::score_json_chunks(&index, query, &query_embedding, settings, top_k))
            .unwrap_or_default()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::NoopEmbedder;

    fn setup(engine: RetrievalEngine) -> (tempfile::TempDir, RetrievalIndex, RetrievalDomainConfig, RetrievalStorageConfig) {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("memory")).unwrap();
        std::fs::write(
            dir.path().join("memory/MEMORY.md"),
            "capybaras are calm animals\nrust has fearless concurrency\n",
        )
        .unwrap();
        let index = RetrievalIndex::new(dir.path(), Arc::new(NoopEmbedder));
        let settings = RetrievalDomainConfig::default();
        let storage = RetrievalStorageConfig {
            engine,
            ..Default::default()
        };
        (dir, index, settings, storage)
    }

    #[tokio::test]
    async fn json_engine_retrieves_lexically() {
        let (_dir, index, settings, storage) = setup(RetrievalEngine::Json);
        let hits = index
            .retrieve(Domain::Memory, "capybaras", 3, &settings, &storage)
            .await;
        assert!(!hits.is_empty());
        assert_eq!(hits[0].source, "memory/MEMORY.md");
    }

    #[tokio::test]
    async fn sqlite_engine_retrieves_and_populates_meta() {
        let (dir, index, settings, storage) = setup(RetrievalEngine::Sqlite);
        let hits = index
            .retrieve(Domain::Memory, "concurrency", 3, &settings, &storage)
            .await;
        assert!(!hits.is_empty());

        let store = SqliteStore::open(dir.path(), &storage.db_path).unwrap();
        let meta = store.get_meta("memory").unwrap().unwrap();
        assert_eq!(meta.digest, index.digest(Domain::Memory, &settings));
    }

    #[tokio::test]
    async fn rebuild_twice_produces_identical_meta() {
        let (dir, index, settings, storage) = setup(RetrievalEngine::Sqlite);
        index.rebuild(Domain::Memory, &settings, &storage).await.unwrap();
        let store = SqliteStore::open(dir.path(), &storage.db_path).unwrap();
        let first = store.get_meta("memory").unwrap().unwrap();
        index.rebuild(Domain::Memory, &settings, &storage).await.unwrap();
        let second = store.get_meta("memory").unwrap().unwrap();
        assert_eq!(first.digest, second.digest);
        assert_eq!(first.chunk_size, second.chunk_size);
        assert_eq!(first.embedding_provider, second.embedding_provider);
    }

    #[tokio::test]
    async fn content_change_flips_the_digest_and_triggers_rebuild() {
        let (dir, index, settings, storage) = setup(RetrievalEngine::Sqlite);
        index.rebuild(Domain::Memory, &settings, &storage).await.unwrap();
        let before = index.digest(Domain::Memory, &settings);

        std::fs::write(dir.path().join("memory/MEMORY.md"), "entirely new text\n").unwrap();
        let after = index.digest(Domain::Memory, &settings);
        assert_ne!(before, after);

        let hits = index
            .retrieve(Domain::Memory, "entirely", 3, &settings, &storage)
            .await;
        assert!(!hits.is_empty());
    }

    #[tokio::test]
    async fn chunk_param_change_flips_the_digest() {
        let (_dir, index, settings, _storage) = setup(RetrievalEngine::Json);
        let mut other = settings.clone();
        other.chunk_size = 128;
        assert_ne!(
            index.digest(Domain::Memory, &settings),
            index.digest(Domain::Memory, &other)
        );
    }

    #[tokio::test]
    async fn legacy_json_index_is_imported_into_sqlite() {
        let (dir, index, settings, storage) = setup(RetrievalEngine::Sqlite);
        // Seed a legacy JSON index whose digest matches the current inputs,
        // with a sentinel embedding that a rebuild would not produce.
        let digest = index.digest(Domain::Memory, &settings);
        let legacy = JsonIndex::new(
            digest.clone(),
            "openai",
            "legacy-model",
            String::new(),
            vec![IndexedChunk {
                source: "memory/MEMORY.md".into(),
                text: "legacy chunk about capybaras".into(),
                embedding: vec![0.25, 0.75],
            }],
        );
        json_store::save(&Domain::Memory.json_index_file(dir.path()), &legacy).unwrap();

        let hits = index
            .retrieve(Domain::Memory, "legacy capybaras", 3, &settings, &storage)
            .await;
        assert!(!hits.is_empty());
        let store = SqliteStore::open(dir.path(), &storage.db_path).unwrap();
        let meta = store.get_meta("memory").unwrap().unwrap();
        assert_eq!(meta.digest, digest);
        assert_eq!(meta.embedding_model, "legacy-model");
    }

    #[tokio::test]
    async fn knowledge_domain_walks_nested_files() {
        let (dir, index, _settings, storage) = setup(RetrievalEngine::Json);
        std::fs::create_dir_all(dir.path().join("knowledge/guides")).unwrap();
        std::fs::write(
            dir.path().join("knowledge/guides/intro.md"),
            "warren indexes knowledge files recursively",
        )
        .unwrap();
        let settings = RetrievalDomainConfig {
            chunk_size: 400,
            chunk_overlap: 80,
            ..Default::default()
        };
        let hits = index
            .retrieve(Domain::Knowledge, "recursively", 3, &settings, &storage)
            .await;
        assert!(!hits.is_empty());
        assert_eq!(hits[0].source, "knowledge/guides/intro.md");
    }
}
