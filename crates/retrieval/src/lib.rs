//! Content-addressed chunk+embedding retrieval index.
//!
//! Two domains (`memory`, `knowledge`), two interchangeable backends (SQLite
//! with an FTS5 prefilter, and a JSON fallback file), one digest scheme:
//! the index is keyed by a hash of its inputs and chunking parameters, and
//! rebuilt whenever the digest no longer matches.

pub mod chunk;
pub mod embedding;
pub mod indexer;
pub mod json_store;
pub mod sqlite_store;

pub use embedding::{cosine_similarity, Embedder, HttpEmbedder, NoopEmbedder};
pub use indexer::{Domain, RetrievalIndex};

use serde::{Deserialize, Serialize};

/// One stored chunk with its embedding.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub source: String,
    pub text: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
}
