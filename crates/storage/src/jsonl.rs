//! Append-only JSONL file helpers.
//!
//! One record per UTF-8 physical line. Writers take the path lock for the
//! duration of the append; readers parse leniently and skip corrupt lines.

use std::io::Write;
use std::path::Path;

use serde_json::Value;

use warren_domain::Result;

use crate::locks::PathLocks;
use crate::redaction::redact_json_line;

/// Append one redacted record. Creates parent directories on first write.
pub fn append_record(path: &Path, payload: &Value) -> Result<()> {
    let lock = PathLocks::lock_for(path);
    let _guard = lock.lock();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", redact_json_line(payload))?;
    Ok(())
}

/// Read up to `limit` records, newest first. Corrupt lines are skipped.
pub fn read_tail(path: &Path, limit: usize) -> Vec<Value> {
    let lock = PathLocks::lock_for(path);
    let text = {
        let _guard = lock.lock();
        match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return Vec::new(),
        }
    };
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let take = limit.max(1).min(lines.len());
    lines[lines.len() - take..]
        .iter()
        .rev()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(|v| v.is_object())
        .collect()
}

/// Trim the file to its last `keep` lines.
pub fn trim_to_last(path: &Path, keep: usize) -> Result<()> {
    let lock = PathLocks::lock_for(path);
    let _guard = lock.lock();
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return Ok(()),
    };
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let keep = keep.max(1);
    if lines.len() <= keep {
        return Ok(());
    }
    let trimmed = lines[lines.len() - keep..].join("\n") + "\n";
    std::fs::write(path, trimmed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_then_tail_round_trips_newest_first() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rows.jsonl");
        for idx in 0..5 {
            append_record(&path, &json!({"idx": idx})).unwrap();
        }
        let rows = read_tail(&path, 3);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["idx"], 4);
        assert_eq!(rows[2]["idx"], 2);
    }

    #[test]
    fn tail_skips_corrupt_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rows.jsonl");
        append_record(&path, &json!({"ok": true})).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "not json"))
            .unwrap();
        append_record(&path, &json!({"ok": false})).unwrap();
        let rows = read_tail(&path, 10);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn trim_keeps_only_the_tail() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rows.jsonl");
        for idx in 0..10 {
            append_record(&path, &json!({"idx": idx})).unwrap();
        }
        trim_to_last(&path, 4).unwrap();
        let rows = read_tail(&path, 100);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0]["idx"], 9);
        assert_eq!(rows[3]["idx"], 6);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(read_tail(&dir.path().join("none.jsonl"), 5).is_empty());
    }
}
