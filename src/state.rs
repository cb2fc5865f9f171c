/// Engine-wide state: counters and cursor bookkeeping persisted as a single
/// JSON file, read-modify-written under the store lock with a monotonically
/// increasing `revision`.
///
/// Grounded on the teacher's `telemetry.rs::SessionStats` accumulation shape
/// (a struct of running counters updated in place) and persisted the way
/// `sessions.rs` persists structured JSON, but as one file rather than a log.
use crate::error::Result;
use crate::fsstore::Store;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct State {
    pub version: u32,
    pub revision: u64,
    pub created_at: String,
    pub updated_at: String,
    pub current_session_id: Option<String>,
    pub session_count: u64,
    pub last_session_created_at: Option<String>,
    pub last_compacted_at: Option<String>,
    pub compact_count: u64,
    pub last_pack_tokens: Option<usize>,
    pub last_search_hits: Option<usize>,
    pub last_search_query: Option<String>,
    pub last_search_at: Option<String>,
    pub last_search_index: Option<String>,
    pub search_count: u64,
    pub timeline_count: u64,
    pub get_count: u64,
    pub stats_count: u64,
    pub last_timeline_anchor: Option<String>,
    pub workset_used: Option<usize>,
    pub bad_line_count: u64,
    pub last_migration_bad_lines: Option<u64>,
    pub last_migration_at: Option<String>,
}

impl Default for State {
    fn default() -> Self {
        let now = crate::turn::now_rfc3339();
        Self {
            version: 1,
            revision: 0,
            created_at: now.clone(),
            updated_at: now,
            current_session_id: None,
            session_count: 0,
            last_session_created_at: None,
            last_compacted_at: None,
            compact_count: 0,
            last_pack_tokens: None,
            last_search_hits: None,
            last_search_query: None,
            last_search_at: None,
            last_search_index: None,
            search_count: 0,
            timeline_count: 0,
            get_count: 0,
            stats_count: 0,
            last_timeline_anchor: None,
            workset_used: None,
            bad_line_count: 0,
            last_migration_bad_lines: None,
            last_migration_at: None,
        }
    }
}

const STATE_FILE: &str = "state.json";

impl State {
    pub fn read(store: &Store) -> Result<Self> {
        let raw = store.read_text(STATE_FILE)?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn write(&self, store: &Store) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        store.write_text_atomic(STATE_FILE, &raw)
    }

    /// Read-modify-write under the store lock: loads the current state,
    /// applies `f`, bumps `revision` and `updated_at`, then persists.
    pub fn update(store: &Store, stale_ms: u64, f: impl FnOnce(&mut State)) -> Result<State> {
        store.with_lock(stale_ms, || {
            let mut state = Self::read(store)?;
            f(&mut state);
            state.revision += 1;
            state.updated_at = crate::turn::now_rfc3339();
            state.write(store)?;
            Ok(state)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_zero_revision() {
        let s = State::default();
        assert_eq!(s.revision, 0);
        assert_eq!(s.compact_count, 0);
    }

    #[test]
    fn read_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join(".contextfs")).unwrap();
        let s = State::read(&store).unwrap();
        assert_eq!(s.revision, 0);
    }

    #[test]
    fn update_bumps_revision_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join(".contextfs")).unwrap();
        let s1 = State::update(&store, 1000, |s| s.search_count += 1).unwrap();
        assert_eq!(s1.revision, 1);
        assert_eq!(s1.search_count, 1);
        let s2 = State::update(&store, 1000, |s| s.search_count += 1).unwrap();
        assert_eq!(s2.revision, 2);
        assert_eq!(s2.search_count, 2);
    }
}
