//! System prompt assembly from workspace bootstrap files.
//!
//! A fixed, ordered set of sections is concatenated, each truncated to the
//! per-section cap and the whole prompt to the total cap. In rag mode the
//! long-term memory section is replaced by a retrieval directive. Packs are
//! cached on a digest of the mode flags and section mtimes.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use warren_domain::config::{InjectionMode, RuntimeConfig};

const RAG_GUIDANCE: &str = "[Memory Retrieval Mode]\n\
Long-term memory is injected dynamically via retrieval for this request.\n\
Use the retrieval context as temporary input and do not assume it is persisted.";

/// (label, workspace-relative path) in injection order.
const SECTIONS: [(&str, &str); 7] = [
    ("Skills Snapshot", "SKILLS_SNAPSHOT.md"),
    ("Soul", "workspace/SOUL.md"),
    ("Identity", "workspace/IDENTITY.md"),
    ("User Profile", "workspace/USER.md"),
    ("Heartbeat Guide", "workspace/HEARTBEAT.md"),
    ("Agents Guide", "workspace/AGENTS.md"),
    ("Long-term Memory", "memory/MEMORY.md"),
];

#[derive(Clone, Debug)]
pub struct PromptPack {
    pub prompt: String,
    pub digest: String,
    pub truncated_files: Vec<String>,
}

#[derive(Default)]
pub struct PromptBuilder {
    cache: Mutex<HashMap<String, PromptPack>>,
}

fn truncate_component(text: &str, max_chars: usize) -> (String, bool) {
    if text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }
    let cut: String = text.chars().take(max_chars).collect();
    (format!("{cut}\n...[truncated]"), true)
}

fn mtime_key(path: &Path) -> String {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|duration| duration.as_nanos().to_string())
        .unwrap_or_else(|| "-1".into())
}

fn sha256_hex(parts: &[String]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build (or fetch from cache) the system prompt for one turn.
    pub fn build(
        &self,
        root_dir: &Path,
        config: &RuntimeConfig,
        rag_mode: bool,
        is_first_turn: bool,
    ) -> PromptPack {
        if config.injection_mode == InjectionMode::FirstTurnOnly && !is_first_turn {
            return PromptPack {
                prompt: String::new(),
                digest: String::new(),
                truncated_files: Vec::new(),
            };
        }

        // Cache key: flags ⊕ caps ⊕ every section's mtime.
        let mut key_parts: Vec<String> = vec![
            rag_mode.to_string(),
            format!("{:?}", config.injection_mode),
            config.bootstrap_max_chars.to_string(),
            config.bootstrap_total_max_chars.to_string(),
        ];
        for (_, rel_path) in SECTIONS {
            key_parts.push(format!("{rel_path}:{}", mtime_key(&root_dir.join(rel_path))));
        }
        let cache_key = sha256_hex(&key_parts);
        if let Some(cached) = self.cache.lock().get(&cache_key) {
            return cached.clone();
        }

        let mut rendered: Vec<String> = Vec::with_capacity(SECTIONS.len());
        let mut truncated_files = Vec::new();
        for (label, rel_path) in SECTIONS {
            let content = if rag_mode && rel_path == "memory/MEMORY.md" {
                RAG_GUIDANCE.to_string()
            } else {
                match std::fs::read_to_string(root_dir.join(rel_path)) {
                    Ok(text) => text,
                    Err(_) => format!("[MISSING FILE: {rel_path}]"),
                }
            };
            let (content, was_truncated) =
                truncate_component(&content, config.bootstrap_max_chars);
            if was_truncated {
                truncated_files.push(rel_path.to_string());
            }
            rendered.push(format!("<!-- {label} -->\n{content}"));
        }

        let mut prompt = rendered.join("\n\n");
        if prompt.chars().count() > config.bootstrap_total_max_chars {
            prompt = prompt
                .chars()
                .take(config.bootstrap_total_max_chars)
                .collect();
            prompt.push_str("\n...[truncated_total]");
        }

        let pack = PromptPack {
            digest: sha256_hex(&[prompt.clone()]),
            prompt,
            truncated_files,
        };
        self.cache.lock().insert(cache_key, pack.clone());
        pack
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
