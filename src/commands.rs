/// The command surface: one function per `ctx` verb, returning a typed
/// `Output` so the human-text and `--json` renderings can never drift from
/// each other.
///
/// Grounded on `tools/mod.rs`'s `dispatch(name, args) -> Result<String>`
/// table (here split into one function per command rather than a single
/// string-keyed dispatcher, since each `ctx` verb has its own argument
/// shape and `clap` already does the dispatching).
use crate::archive;
use crate::compactor;
use crate::config::Config;
use crate::derived_index::DerivedIndex;
use crate::error::Result;
use crate::fsstore::Store;
use crate::hotlog;
use crate::packer;
use crate::pins;
use crate::provider::embedding as embed_provider;
use crate::retrieval::{self, Scope};
use crate::state::State;
use crate::traces;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Output {
    Ls {
        settings: std::collections::HashMap<String, String>,
    },
    Stats {
        revision: u64,
        hot_turns: usize,
        archive_turns: usize,
        pins: usize,
        search_count: u64,
        compact_count: u64,
    },
    Cat {
        text: String,
    },
    Pin {
        pins: Vec<pins::Pin>,
    },
    Save {
        id: String,
    },
    Compact {
        rolled: usize,
        kept: usize,
        new_bullets: usize,
        ran: bool,
    },
    Search {
        hits: Vec<retrieval::SearchHit>,
    },
    Timeline {
        turns: Vec<crate::turn::Turn>,
    },
    Get {
        turn: Option<crate::turn::Turn>,
    },
    Traces {
        traces: Vec<traces::RetrievalTrace>,
    },
    Trace {
        trace: Option<traces::RetrievalTrace>,
    },
    Gc {
        bad_lines_quarantined: u64,
    },
    Reindex {
        turn_rows: i64,
        vector_rows: i64,
        ann_available: bool,
    },
}

impl Output {
    /// Human-readable rendering, used when `--json` is not passed.
    pub fn to_text(&self) -> String {
        match self {
            Output::Ls { settings } => {
                let mut keys: Vec<_> = settings.keys().collect();
                keys.sort();
                keys.iter()
                    .map(|k| format!("{k} = {}", settings[*k]))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Output::Stats {
                revision,
                hot_turns,
                archive_turns,
                pins,
                search_count,
                compact_count,
            } => format!(
                "revision={revision} hot_turns={hot_turns} archive_turns={archive_turns} pins={pins} search_count={search_count} compact_count={compact_count}"
            ),
            Output::Cat { text } => text.clone(),
            Output::Pin { pins } => pins
                .iter()
                .map(|p| format!("[{}] {}", p.id, p.text))
                .collect::<Vec<_>>()
                .join("\n"),
            Output::Save { id } => id.clone(),
            Output::Compact { rolled, kept, new_bullets, ran } => {
                if *ran {
                    format!("compacted: rolled={rolled} kept={kept} new_bullets={new_bullets}")
                } else {
                    "no compaction needed".to_string()
                }
            }
            Output::Search { hits } => hits
                .iter()
                .map(|h| format!("{} [{:.3}] {}", h.id, h.score, h.summary))
                .collect::<Vec<_>>()
                .join("\n"),
            Output::Timeline { turns } => turns
                .iter()
                .map(|t| format!("{} [{:?}] {}", t.ts, t.role, t.text))
                .collect::<Vec<_>>()
                .join("\n"),
            Output::Get { turn } => match turn {
                Some(t) => t.text.clone(),
                None => "not found".to_string(),
            },
            Output::Traces { traces } => traces
                .iter()
                .map(|t| format!("{} {} {} hits={}", t.ts, t.op, t.query, t.hit_count))
                .collect::<Vec<_>>()
                .join("\n"),
            Output::Trace { trace } => match trace {
                Some(t) => format!("{} {} {} hits={}", t.ts, t.op, t.query, t.hit_count),
                None => "not found".to_string(),
            },
            Output::Gc { bad_lines_quarantined } => {
                format!("quarantined {bad_lines_quarantined} bad line(s)")
            }
            Output::Reindex { turn_rows, vector_rows, ann_available } => format!(
                "reindexed: turns={turn_rows} vectors={vector_rows} ann_available={ann_available}"
            ),
        }
    }
}

pub fn ls(cfg: &Config) -> Output {
    Output::Ls {
        settings: crate::config::as_display_map(cfg),
    }
}

pub fn stats(store: &Store, cfg: &Config) -> Result<Output> {
    let state = State::read(store)?;
    let hot_turns = hotlog::read_history(store)?.len();
    let archive_turns = archive::rebuild_index(store)?.len();
    let pins_count = pins::read_all(store)?.len();
    State::update(store, cfg.lock_stale_ms, |s| s.stats_count += 1)?;
    Ok(Output::Stats {
        revision: state.revision,
        hot_turns,
        archive_turns,
        pins: pins_count,
        search_count: state.search_count,
        compact_count: state.compact_count,
    })
}

pub fn cat(store: &Store, cfg: &Config, state: &State) -> Result<Output> {
    let turns = hotlog::read_history(store)?;
    let pack = packer::build(store, cfg, state, &turns, &[], cfg.token_threshold)?;
    Ok(Output::Cat { text: pack.block })
}

pub fn pin_add(store: &Store, cfg: &Config, text: &str) -> Result<Output> {
    let pins = pins::add(store, text, cfg.pins_max_items)?;
    Ok(Output::Pin { pins })
}

#[allow(clippy::too_many_arguments)]
pub async fn save(
    store: &Store,
    cfg: &Config,
    text: &str,
    title: Option<&str>,
    role: Option<&str>,
    kind: Option<&str>,
    session: Option<&str>,
) -> Result<Output> {
    let result = retrieval::save_memory(store, cfg, text, title, role, kind, session).await?;
    Ok(Output::Save { id: result.id })
}

pub async fn compact(store: &Store, cfg: &Config, force: bool) -> Result<Output> {
    let report = compactor::maybe_compact(store, cfg, force).await?;
    Ok(Output::Compact {
        rolled: report.rolled,
        kept: report.kept,
        new_bullets: report.new_bullets,
        ran: report.ran,
    })
}

pub async fn search(
    store: &Store,
    cfg: &Config,
    query: &str,
    k: Option<usize>,
    scope: Scope,
    session: Option<&str>,
) -> Result<Output> {
    let hits = retrieval::search(store, cfg, query, k.unwrap_or(cfg.search_default_k), scope, session).await?;
    Ok(Output::Search { hits })
}

#[allow(clippy::too_many_arguments)]
pub fn timeline(
    store: &Store,
    cfg: &Config,
    anchor_id: &str,
    before: Option<usize>,
    after: Option<usize>,
    scope: Scope,
    session: Option<&str>,
) -> Result<Output> {
    let turns = retrieval::timeline(
        store,
        cfg,
        anchor_id,
        before.unwrap_or(cfg.timeline_before_default),
        after.unwrap_or(cfg.timeline_after_default),
        scope,
        session,
    )?;
    Ok(Output::Timeline { turns })
}

pub fn get(
    store: &Store,
    cfg: &Config,
    id: &str,
    head: Option<usize>,
    scope: Scope,
    session: Option<&str>,
) -> Result<Output> {
    let turn = retrieval::get(store, cfg, id, head, scope, session)?;
    Ok(Output::Get { turn })
}

pub fn traces_tail(store: &Store, cfg: &Config, tail: Option<usize>) -> Result<Output> {
    let traces = traces::read_retrieval_traces(store, tail.unwrap_or(cfg.traces_tail_default))?;
    Ok(Output::Traces { traces })
}

pub fn trace_by_id(store: &Store, id: &str) -> Result<Output> {
    let trace = traces::find_retrieval_trace_by_id(store, id)?;
    Ok(Output::Trace { trace })
}

pub fn gc(store: &Store) -> Result<Output> {
    let bad_lines_quarantined = hotlog::migrate_and_quarantine(store)?;
    Ok(Output::Gc { bad_lines_quarantined })
}

/// Rebuild the derived index from scratch: every archive and hot turn is
/// re-inserted (archive first, hot second, so hot wins on id conflict), and
/// — when vectors are enabled — every turn's text is re-embedded so the
/// vector table matches the current provider/model rather than whatever
/// was live the last time a turn was appended.
pub async fn reindex(store: &Store, cfg: &Config) -> Result<Output> {
    let archive_turns = archive::read_all_ordered(store)?;
    let hot_turns = hotlog::read_history(store)?;
    let index_path = cfg
        .index_path
        .as_ref()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| store.path("index.sqlite"));
    let mut idx = DerivedIndex::open(&index_path, cfg)?;

    let mut vectors = Vec::new();
    if cfg.vector_enabled {
        let all_turns: Vec<&crate::turn::Turn> = archive_turns.iter().chain(hot_turns.iter()).collect();
        let texts: Vec<String> = all_turns.iter().map(|t| t.text.clone()).collect();
        if !texts.is_empty() {
            if let Ok(embedded) = embed_provider::embed_batch(cfg, &texts).await {
                for (t, v) in all_turns.iter().zip(embedded.into_iter()) {
                    vectors.push((t.id.clone(), v));
                }
            }
        }
    }

    let provider = format!("{:?}", cfg.vector_provider).to_lowercase();
    idx.rebuild(&archive_turns, &hot_turns, &vectors, &provider, &cfg.embedding_model)?;
    let report = idx.doctor()?;
    Ok(Output::Reindex {
        turn_rows: report.turn_rows,
        vector_rows: report.vector_rows,
        ann_available: report.ann_available,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::{Role, Turn};

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join(".contextfs")).unwrap();
        (dir, store)
    }

    #[test]
    fn ls_lists_settings() {
        let cfg = Config::default();
        let out = ls(&cfg);
        if let Output::Ls { settings } = &out {
            assert!(settings.contains_key("recentTurns"));
        } else {
            panic!("wrong variant");
        }
        assert!(out.to_text().contains("recentTurns"));
    }

    #[test]
    fn stats_reports_counts() {
        let (_dir, store) = open_store();
        let cfg = Config::default();
        pins::add(&store, "a pin", 50).unwrap();
        let out = stats(&store, &cfg).unwrap();
        if let Output::Stats { pins, .. } = out {
            assert_eq!(pins, 1);
        } else {
            panic!("wrong variant");
        }
    }

    #[test]
    fn pin_add_returns_updated_list() {
        let (_dir, store) = open_store();
        let cfg = Config::default();
        let out = pin_add(&store, &cfg, "new pin").unwrap();
        if let Output::Pin { pins } = out {
            assert_eq!(pins.len(), 1);
            assert_eq!(pins[0].text, "new pin");
        } else {
            panic!("wrong variant");
        }
    }

    #[tokio::test]
    async fn save_creates_a_turn_and_returns_its_id() {
        let (_dir, store) = open_store();
        let cfg = Config::default();
        let out = save(&store, &cfg, "remember this", None, None, None, None).await.unwrap();
        if let Output::Save { id } = out {
            let turns = hotlog::read_history(&store).unwrap();
            assert!(turns.iter().any(|t| t.id == id));
        } else {
            panic!("wrong variant");
        }
    }

    #[test]
    fn gc_quarantines_bad_lines() {
        let (_dir, store) = open_store();
        store.append("history.ndjson", "garbage").unwrap();
        let out = gc(&store).unwrap();
        if let Output::Gc { bad_lines_quarantined } = out {
            assert_eq!(bad_lines_quarantined, 1);
        } else {
            panic!("wrong variant");
        }
    }

    #[test]
    fn get_missing_turn_returns_none() {
        let (_dir, store) = open_store();
        let cfg = Config::default();
        let out = get(&store, &cfg, "missing", None, Scope::All, None).unwrap();
        assert_eq!(out.to_text(), "not found");
    }

    #[test]
    fn timeline_text_rendering_includes_role() {
        let (_dir, store) = open_store();
        let cfg = Config::default();
        hotlog::append(
            &store,
            &cfg,
            &Turn {
                id: "a".to_string(),
                ts: "2026-01-01T00:00:00Z".to_string(),
                session_id: None,
                role: Role::User,
                kind: None,
                refs: vec![],
                tags: vec![],
                text: "hi".to_string(),
            },
        )
        .unwrap();
        let out = timeline(&store, &cfg, "a", Some(0), Some(0), Scope::All, None).unwrap();
        assert!(out.to_text().contains("User"));
    }
}
