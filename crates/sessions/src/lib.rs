//! Per-agent session storage.
//!
//! One JSON file per session under `<root>/sessions/`, archived copies in
//! `sessions/archived_sessions/`, and compression snapshots in
//! `sessions/archive/`. All mutation goes through the path-lock registry so
//! a streaming run and an HTTP handler never interleave a read-modify-write.

mod store;

pub use store::{ChatMessage, LiveResponse, Session, SessionStore, SessionSummary};
