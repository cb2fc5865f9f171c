/// The hot (recent) turn log: `history.ndjson` plus its bad-line quarantine.
///
/// Grounded on the teacher's `sessions.rs::append_turn`/`load_session_turns`
/// (`OpenOptions::append` for writes, one `serde_json::from_str` per line for
/// reads) generalized from a single session's turns to the full hot log, with
/// migration, quarantine, and normalization added per spec §4.3.
use crate::config::Config;
use crate::derived_index::DerivedIndex;
use crate::error::{ContextFsError, Result};
use crate::fsstore::Store;
use crate::turn::Turn;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

const HISTORY_FILE: &str = "history.ndjson";
const BAD_FILE: &str = "history.bad.ndjson";

/// Read every line of the hot log, loosely parsed and normalized (role
/// folding, ts fallback, ref inference, id inference). Lines that don't even
/// loosely parse (no `text` field) are skipped here — callers that care use
/// `migrate_and_quarantine` to move them aside explicitly.
pub fn read_history(store: &Store) -> Result<Vec<Turn>> {
    let raw = store.read_text(HISTORY_FILE)?;
    let epoch_ms = crate::turn::epoch_ms_now();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut turns = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(raw_turn) = crate::turn::loose_parse(&value) else {
            continue;
        };
        turns.push(crate::turn::normalize(raw_turn, idx as u64, epoch_ms, &mut seen_ids));
    }
    Ok(turns)
}

fn index_path(store: &Store, cfg: &Config) -> std::path::PathBuf {
    cfg.index_path
        .as_ref()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| store.path("index.sqlite"))
}

/// Best-effort upsert of one turn's lexical row into the derived index.
/// Failures are logged (when `cfg.debug`) and never propagate — the append
/// itself must succeed regardless of index health.
fn upsert_lexical_best_effort(store: &Store, cfg: &Config, turn: &Turn) {
    if !cfg.index_enabled {
        return;
    }
    match DerivedIndex::open(&index_path(store, cfg), cfg) {
        Ok(mut idx) => {
            if let Err(e) = idx.upsert_turn(turn, "hot") {
                crate::debug_log!(cfg, "derived index upsert failed for {}: {e}", turn.id);
            }
        }
        Err(e) => crate::debug_log!(cfg, "derived index open failed: {e}"),
    }
}

/// Append one turn to the hot log, then best-effort upsert its lexical row
/// into the derived index if enabled (spec §4.3: "the append also upserts
/// the row into the lexical+vector derived index if enabled, using
/// best-effort").
pub fn append(store: &Store, cfg: &Config, turn: &Turn) -> Result<()> {
    let line = serde_json::to_string(turn)?;
    store.append(HISTORY_FILE, &line)?;
    upsert_lexical_best_effort(store, cfg, turn);
    Ok(())
}

/// Append a turn and, if vector search is enabled, compute and upsert its
/// embedding into both the hot embedding view and the derived vector index.
/// Used by `save_memory`, the one production path that creates new turns
/// outside of compaction. Embedding failures are logged and never fail the
/// append.
pub async fn append_with_embedding(store: &Store, cfg: &Config, turn: &Turn) -> Result<()> {
    append(store, cfg, turn)?;
    if !cfg.vector_enabled {
        return Ok(());
    }
    match crate::provider::embedding::embed_batch(cfg, &[turn.text.clone()]).await {
        Ok(mut vectors) => {
            if let Some(vector) = vectors.pop() {
                let row = crate::embedding::EmbeddingRow {
                    id: turn.id.clone(),
                    text_hash: crate::embedding::text_hash(&turn.text),
                    vector: vector.clone(),
                    dim: vector.len(),
                    model: cfg.embedding_model.clone(),
                    source: "hot".to_string(),
                };
                if let Err(e) = crate::embedding::append_hot(store, &row) {
                    crate::debug_log!(cfg, "embedding append failed for {}: {e}", turn.id);
                }
                if cfg.index_enabled {
                    if let Ok(mut idx) = DerivedIndex::open(&index_path(store, cfg), cfg) {
                        if let Err(e) = idx.upsert_vector(&turn.id, &vector) {
                            crate::debug_log!(cfg, "vector upsert failed for {}: {e}", turn.id);
                        }
                    }
                }
            }
        }
        Err(e) => crate::debug_log!(cfg, "embedding failed for {}: {e}", turn.id),
    }
    Ok(())
}

/// Replace the hot log wholesale (used by the compactor's phase-3 write and
/// by `gc`). Atomic: readers never see a partially-written file.
pub fn write(store: &Store, turns: &[Turn]) -> Result<()> {
    let mut buf = String::new();
    for t in turns {
        buf.push_str(&serde_json::to_string(t)?);
        buf.push('\n');
    }
    store.write_text_atomic(HISTORY_FILE, &buf)
}

/// Replace one turn by id in place, returning an error if no turn matches.
pub fn update_by_id(store: &Store, id: &str, patch: impl FnOnce(&mut Turn)) -> Result<()> {
    let mut turns = read_history(store)?;
    let found = turns.iter_mut().find(|t| t.id == id);
    match found {
        Some(t) => patch(t),
        None => return Err(ContextFsError::NotFound(format!("turn {id}"))),
    }
    write(store, &turns)
}

/// Scan the hot log for lines that fail even loose parsing (no `text`
/// field, or invalid JSON), moving them to `history.bad.ndjson` keyed by
/// content hash so re-running migration is idempotent (a line already
/// quarantined under its hash is not duplicated). Returns the number of
/// newly-quarantined lines.
pub fn migrate_and_quarantine(store: &Store) -> Result<u64> {
    let raw = store.read_text(HISTORY_FILE)?;
    let existing_bad = store.read_text(BAD_FILE)?;
    let mut known_hashes: HashSet<String> = HashSet::new();
    for line in existing_bad.lines() {
        if let Ok(v) = serde_json::from_str::<Value>(line) {
            if let Some(h) = v.get("hash").and_then(|h| h.as_str()) {
                known_hashes.insert(h.to_string());
            }
        }
    }

    let mut good = String::new();
    let mut newly_bad: Vec<String> = Vec::new();
    let mut quarantined = 0u64;

    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parses = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|v| crate::turn::loose_parse(&v))
            .is_some();
        if parses {
            good.push_str(line);
            good.push('\n');
            continue;
        }
        let hash = line_hash(line);
        if known_hashes.contains(&hash) {
            continue;
        }
        known_hashes.insert(hash.clone());
        let entry = serde_json::json!({
            "hash": hash,
            "raw": line,
            "quarantined_at": crate::turn::now_rfc3339(),
        });
        newly_bad.push(entry.to_string());
        quarantined += 1;
    }

    if quarantined > 0 {
        store.write_text_atomic(HISTORY_FILE, &good)?;
        let mut bad_buf = existing_bad;
        for entry in newly_bad {
            bad_buf.push_str(&entry);
            bad_buf.push('\n');
        }
        store.write_text_atomic(BAD_FILE, &bad_buf)?;
    }

    Ok(quarantined)
}

fn line_hash(line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(line);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::{Role, Turn};

    fn sample_turn(id: &str) -> Turn {
        Turn {
            id: id.to_string(),
            ts: "2026-01-01T00:00:00Z".to_string(),
            session_id: None,
            role: Role::User,
            kind: None,
            refs: vec![],
            tags: vec![],
            text: "hello".to_string(),
        }
    }

    fn open_store() -> (tempfile::TempDir, Store, Config) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join(".contextfs")).unwrap();
        (dir, store, Config::default())
    }

    #[test]
    fn append_and_read_roundtrip() {
        let (_dir, store, cfg) = open_store();
        append(&store, &cfg, &sample_turn("t1")).unwrap();
        append(&store, &cfg, &sample_turn("t2")).unwrap();
        let turns = read_history(&store).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].id, "t1");
    }

    #[test]
    fn update_by_id_mutates_in_place() {
        let (_dir, store, cfg) = open_store();
        append(&store, &cfg, &sample_turn("t1")).unwrap();
        update_by_id(&store, "t1", |t| t.text = "edited".to_string()).unwrap();
        let turns = read_history(&store).unwrap();
        assert_eq!(turns[0].text, "edited");
    }

    #[test]
    fn update_missing_id_errors() {
        let (_dir, store, _cfg) = open_store();
        let err = update_by_id(&store, "missing", |_| {}).unwrap_err();
        assert!(matches!(err, ContextFsError::NotFound(_)));
    }

    #[test]
    fn migrate_quarantines_malformed_lines_idempotently() {
        let (_dir, store, cfg) = open_store();
        append(&store, &cfg, &sample_turn("t1")).unwrap();
        store.append("history.ndjson", "not json at all").unwrap();
        let n = migrate_and_quarantine(&store).unwrap();
        assert_eq!(n, 1);
        let turns = read_history(&store).unwrap();
        assert_eq!(turns.len(), 1);
        // running again finds nothing new to quarantine
        let n2 = migrate_and_quarantine(&store).unwrap();
        assert_eq!(n2, 0);
    }

    #[test]
    fn lines_missing_role_and_id_are_normalized_not_skipped() {
        let (_dir, store, _cfg) = open_store();
        store.append("history.ndjson", r#"{"text":"bare line, no role or id"}"#).unwrap();
        let turns = read_history(&store).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::Unknown);
        assert!(turns[0].id.starts_with("H-"));
    }
}
