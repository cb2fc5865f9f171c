/// Embedding rows: one per turn, stored as hot/archive NDJSON views merged
/// by id (archive wins, mirroring `archive.rs`'s last-line-wins semantics).
///
/// Grounded on `llmspell-memory`'s embedding-row shape (text hash + vector +
/// provenance) and on the teacher's `sessions.rs` JSONL-per-line storage.
use crate::error::Result;
use crate::fsstore::Store;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const HOT_FILE: &str = "embeddings.ndjson";
const ARCHIVE_FILE: &str = "embeddings.archive.ndjson";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingRow {
    pub id: String,
    pub text_hash: String,
    pub vector: Vec<f32>,
    pub dim: usize,
    pub model: String,
    pub source: String,
}

pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text);
    format!("{:x}", hasher.finalize())
}

fn read_ndjson(store: &Store, file: &str) -> Result<Vec<EmbeddingRow>> {
    let raw = store.read_text(file)?;
    let mut rows = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(row) = serde_json::from_str::<EmbeddingRow>(line) {
            rows.push(row);
        }
    }
    Ok(rows)
}

pub fn append_hot(store: &Store, row: &EmbeddingRow) -> Result<()> {
    store.append(HOT_FILE, &serde_json::to_string(row)?)
}

pub fn append_archive(store: &Store, row: &EmbeddingRow) -> Result<()> {
    store.append(ARCHIVE_FILE, &serde_json::to_string(row)?)
}

/// Merge hot and archive views by id, archive winning on conflict.
pub fn merged(store: &Store) -> Result<HashMap<String, EmbeddingRow>> {
    let mut map = HashMap::new();
    for row in read_ndjson(store, HOT_FILE)? {
        map.insert(row.id.clone(), row);
    }
    for row in read_ndjson(store, ARCHIVE_FILE)? {
        map.insert(row.id.clone(), row);
    }
    Ok(map)
}

/// A row is stale if its recorded text hash, source, dim, or model no
/// longer matches what the caller expects for the same turn id — any of
/// these drifting means the embedding must be recomputed.
pub fn is_stale(row: &EmbeddingRow, expected_text_hash: &str, expected_dim: usize, expected_model: &str) -> bool {
    row.text_hash != expected_text_hash || row.dim != expected_dim || row.model != expected_model
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, hash: &str) -> EmbeddingRow {
        EmbeddingRow {
            id: id.to_string(),
            text_hash: hash.to_string(),
            vector: vec![0.1, 0.2],
            dim: 2,
            model: "fake-embed-v1".to_string(),
            source: "hot".to_string(),
        }
    }

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join(".contextfs")).unwrap();
        (dir, store)
    }

    #[test]
    fn archive_wins_over_hot_on_merge() {
        let (_dir, store) = open_store();
        append_hot(&store, &row("a", "h1")).unwrap();
        append_archive(&store, &row("a", "h2")).unwrap();
        let merged = merged(&store).unwrap();
        assert_eq!(merged.get("a").unwrap().text_hash, "h2");
    }

    #[test]
    fn staleness_detects_hash_drift() {
        let r = row("a", "h1");
        assert!(is_stale(&r, "h2", 2, "fake-embed-v1"));
        assert!(!is_stale(&r, "h1", 2, "fake-embed-v1"));
    }

    #[test]
    fn staleness_detects_model_drift() {
        let r = row("a", "h1");
        assert!(is_stale(&r, "h1", 2, "other-model"));
    }

    #[test]
    fn text_hash_is_deterministic() {
        assert_eq!(text_hash("hello"), text_hash("hello"));
        assert_ne!(text_hash("hello"), text_hash("goodbye"));
    }
}
