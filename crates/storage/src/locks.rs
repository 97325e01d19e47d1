//! Registry of per-file locks keyed by canonical path.
//!
//! Session files, cron job files, and retrieval indexes are each mutated by
//! several tasks (HTTP handlers, the orchestrator, schedulers). Every store
//! resolves its file through this registry and holds the lock only for the
//! read-modify-write critical section — never across an await point.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

static REGISTRY: Mutex<Option<HashMap<PathBuf, Arc<Mutex<()>>>>> = Mutex::new(None);

/// Process-wide lock registry. Stateless handle; all state is shared.
#[derive(Clone, Copy, Debug, Default)]
pub struct PathLocks;

impl PathLocks {
    /// Lock for the given path. Non-existent files key on their normalized
    /// absolute form so the lock is stable before first write.
    pub fn lock_for(path: &Path) -> Arc<Mutex<()>> {
        let key = path
            .canonicalize()
            .unwrap_or_else(|_| normalize(path));
        let mut registry = REGISTRY.lock();
        let map = registry.get_or_insert_with(HashMap::new);
        map.entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
