/// Retrieval trace log: one NDJSON line per `search`/`timeline`/`get` call,
/// rotated by size so the trace directory never grows unbounded.
///
/// Grounded on `telemetry.rs`'s append-only `append_record`/`load_all`
/// pattern (JSONL, read-whole-file, tolerate errors silently on write) with
/// rotation added: once the active file exceeds `traces_max_bytes`, it is
/// renamed aside and a fresh one started, keeping at most `traces_max_files`
/// rotated files.
use crate::config::Config;
use crate::error::Result;
use crate::fsstore::{self, Store};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalTrace {
    pub id: String,
    pub ts: String,
    pub op: String,
    pub query: String,
    pub hit_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

const TRACES_DIR: &str = "traces";
const ACTIVE_FILE: &str = "traces/current.ndjson";

fn traces_dir(store: &Store) -> PathBuf {
    store.path(TRACES_DIR)
}

fn active_path(store: &Store) -> PathBuf {
    store.path(ACTIVE_FILE)
}

pub fn append_trace(store: &Store, cfg: &Config, trace: &RetrievalTrace) -> Result<()> {
    if !cfg.traces_enabled {
        return Ok(());
    }
    fs::create_dir_all(traces_dir(store))?;
    rotate_if_needed(store, cfg)?;
    let line = serde_json::to_string(trace)?;
    fsstore::append(&active_path(store), &line)
}

fn rotate_if_needed(store: &Store, cfg: &Config) -> Result<()> {
    let path = active_path(store);
    let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    if size < cfg.traces_max_bytes {
        return Ok(());
    }
    let rotated_name = format!("traces/{}.ndjson", crate::turn::now_rfc3339().replace([':', '.'], "-"));
    fs::rename(&path, store.path(&rotated_name))?;

    let mut rotated: Vec<PathBuf> = fs::read_dir(traces_dir(store))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.file_name().and_then(|n| n.to_str()).map(|n| n != "current.ndjson").unwrap_or(false))
        .collect();
    rotated.sort();
    while rotated.len() > cfg.traces_max_files {
        let oldest = rotated.remove(0);
        let _ = fs::remove_file(oldest);
    }
    Ok(())
}

/// Read the last `tail` trace lines across all trace files, newest last,
/// current file's lines taking priority over rotated files when `tail` is
/// smaller than what's on disk.
pub fn read_retrieval_traces(store: &Store, tail: usize) -> Result<Vec<RetrievalTrace>> {
    let dir = traces_dir(store);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    files.sort();

    let mut all = Vec::new();
    for f in files {
        let raw = fs::read_to_string(&f).unwrap_or_default();
        for line in raw.lines() {
            if let Ok(t) = serde_json::from_str::<RetrievalTrace>(line) {
                all.push(t);
            }
        }
    }
    if all.len() > tail {
        let start = all.len() - tail;
        Ok(all.split_off(start))
    } else {
        Ok(all)
    }
}

pub fn find_retrieval_trace_by_id(store: &Store, id: &str) -> Result<Option<RetrievalTrace>> {
    let all = read_retrieval_traces(store, usize::MAX)?;
    Ok(all.into_iter().rev().find(|t| t.id == id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join(".contextfs")).unwrap();
        (dir, store)
    }

    fn trace(id: &str, query: &str) -> RetrievalTrace {
        RetrievalTrace {
            id: id.to_string(),
            ts: "2026-01-01T00:00:00Z".to_string(),
            op: "search".to_string(),
            query: query.to_string(),
            hit_count: 1,
            error: None,
        }
    }

    #[test]
    fn append_and_read_roundtrip() {
        let (_dir, store) = open_store();
        let cfg = Config::default();
        append_trace(&store, &cfg, &trace("tr1", "rust")).unwrap();
        append_trace(&store, &cfg, &trace("tr2", "python")).unwrap();
        let traces = read_retrieval_traces(&store, 10).unwrap();
        assert_eq!(traces.len(), 2);
    }

    #[test]
    fn disabled_traces_are_noop() {
        let (_dir, store) = open_store();
        let mut cfg = Config::default();
        cfg.traces_enabled = false;
        append_trace(&store, &cfg, &trace("tr1", "rust")).unwrap();
        let traces = read_retrieval_traces(&store, 10).unwrap();
        assert_eq!(traces.len(), 0);
    }

    #[test]
    fn tail_limits_to_most_recent() {
        let (_dir, store) = open_store();
        let cfg = Config::default();
        for i in 0..5 {
            append_trace(&store, &cfg, &trace(&format!("tr{i}"), "q")).unwrap();
        }
        let traces = read_retrieval_traces(&store, 2).unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[1].id, "tr4");
    }

    #[test]
    fn find_by_id_locates_trace() {
        let (_dir, store) = open_store();
        let cfg = Config::default();
        append_trace(&store, &cfg, &trace("tr1", "rust")).unwrap();
        let found = find_retrieval_trace_by_id(&store, "tr1").unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn rotation_keeps_files_under_cap() {
        let (_dir, store) = open_store();
        let mut cfg = Config::default();
        cfg.traces_max_bytes = 50;
        cfg.traces_max_files = 2;
        for i in 0..10 {
            append_trace(&store, &cfg, &trace(&format!("tr{i}"), "some reasonably long query text")).unwrap();
        }
        let dir_entries: Vec<_> = fs::read_dir(traces_dir(&store)).unwrap().collect();
        assert!(dir_entries.len() <= cfg.traces_max_files + 1);
    }
}
