//! Workspace path containment.
//!
//! Tools and the files API resolve every user-supplied path through
//! [`resolve_workspace_path`]: empty, absolute, and `..`-containing inputs
//! are rejected outright, and the canonicalized result must stay under the
//! canonicalized workspace root.

use std::path::{Component, Path, PathBuf};

#[derive(Debug)]
pub struct InvalidPathError(pub String);

impl std::fmt::Display for InvalidPathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for InvalidPathError {}

/// Resolve `candidate_path` inside `root_dir`, or fail.
pub fn resolve_workspace_path(
    root_dir: &Path,
    candidate_path: &str,
) -> Result<PathBuf, InvalidPathError> {
    let raw = candidate_path.trim();
    if raw.is_empty() {
        return Err(InvalidPathError("Path must not be empty".into()));
    }

    let candidate_input = Path::new(raw);
    if candidate_input.is_absolute() {
        return Err(InvalidPathError("Absolute paths are not allowed".into()));
    }
    if candidate_input
        .components()
        .any(|part| matches!(part, Component::ParentDir))
    {
        return Err(InvalidPathError(
            "Parent directory traversal '..' is not allowed".into(),
        ));
    }

    let root = root_dir
        .canonicalize()
        .map_err(|e| InvalidPathError(format!("Cannot resolve workspace root: {e}")))?;
    let candidate = root.join(candidate_input);

    // Canonicalize the longest existing prefix, then re-append the rest, so
    // not-yet-created files still get a containment check through symlinks.
    let resolved = if candidate.exists() {
        candidate
            .canonicalize()
            .map_err(|e| InvalidPathError(format!("Cannot resolve path: {e}")))?
    } else {
        let mut existing = candidate.as_path();
        let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
        while !existing.exists() {
            match (existing.file_name(), existing.parent()) {
                (Some(name), Some(parent)) => {
                    tail.push(name);
                    existing = parent;
                }
                _ => break,
            }
        }
        let mut resolved = existing
            .canonicalize()
            .map_err(|e| InvalidPathError(format!("Cannot resolve path ancestor: {e}")))?;
        for part in tail.into_iter().rev() {
            resolved.push(part);
        }
        resolved
    };

    if !resolved.starts_with(&root) {
        return Err(InvalidPathError(format!(
            "Path escapes workspace root: {candidate_path}"
        )));
    }

    Ok(resolved)
}
