//! JSON fallback index: one file per domain holding the digest and the
//! in-order chunks with embeddings. Used directly when the `json` engine is
//! selected, as the migration source for SQLite, and as the full-scan
//! fallback when an FTS query comes back empty.

use std::path::Path;

use serde::{Deserialize, Serialize};

use warren_domain::{Error, Result};
use warren_storage::{now_ms, PathLocks};

use crate::IndexedChunk;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonIndex {
    pub digest: String,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub embedding_error: String,
    pub updated_ms: i64,
    pub chunks: Vec<IndexedChunk>,
}

impl JsonIndex {
    pub fn new(
        digest: String,
        embedding_provider: &str,
        embedding_model: &str,
        embedding_error: String,
        chunks: Vec<IndexedChunk>,
    ) -> Self {
        Self {
            digest,
            embedding_provider: embedding_provider.to_string(),
            embedding_model: embedding_model.to_string(),
            embedding_error,
            updated_ms: now_ms(),
            chunks,
        }
    }
}

/// Load and parse an index file. `None` when missing or unparseable.
pub fn load(path: &Path) -> Option<JsonIndex> {
    let lock = PathLocks::lock_for(path);
    let _guard = lock.lock();
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Atomically replace the index file.
pub fn save(path: &Path, index: &JsonIndex) -> Result<()> {
    let lock = PathLocks::lock_for(path);
    let _guard = lock.lock();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(index).map_err(Error::Json)? + "\n";
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        let index = JsonIndex::new(
            "digest-1".into(),
            "openai",
            "text-embedding-3-small",
            String::new(),
            vec![IndexedChunk {
                source: "memory/MEMORY.md".into(),
                text: "hello".into(),
                embedding: vec![0.1, 0.2],
            }],
        );
        save(&path, &index).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.digest, "digest-1");
        assert_eq!(loaded.chunks.len(), 1);
        assert_eq!(loaded.chunks[0].embedding, vec![0.1, 0.2]);
    }

    #[test]
    fn unparseable_file_loads_as_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, "{broken").unwrap();
        assert!(load(&path).is_none());
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(load(&dir.path().join("nope.json")).is_none());
    }
}
