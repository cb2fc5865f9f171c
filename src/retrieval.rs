/// Retrieval: `search`, `timeline`, `get`, and `save_memory`.
///
/// Lexical scoring and CJK n-gram tokenization are hand-rolled rather than
/// pulled from a crate, following the teacher's manual-prefix-matching style
/// in `index.rs`. The result-line shape (summary + match context) is
/// grounded on `tools/search.rs`'s match-summarization ("✓ search → N
/// matches: …"); the hybrid fusion and trace writing are new per spec §4.9.
use crate::archive;
use crate::config::{Config, RetrievalMode};
use crate::derived_index::DerivedIndex;
use crate::error::{ContextFsError, Result};
use crate::fsstore::Store;
use crate::hotlog;
use crate::provider::embedding as embed_provider;
use crate::state::State;
use crate::traces::{self, RetrievalTrace};
use crate::turn::Turn;
use serde::Serialize;

/// Which pool a retrieval operation reads from: the live hot log, the
/// archive, or both merged (hot wins on id conflict).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    All,
    Hot,
    Archive,
}

impl Default for Scope {
    fn default() -> Self {
        Scope::All
    }
}

impl std::str::FromStr for Scope {
    type Err = ContextFsError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Scope::All),
            "hot" => Ok(Scope::Hot),
            "archive" => Ok(Scope::Archive),
            other => Err(ContextFsError::Usage(format!("invalid scope: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub ts: String,
    pub role: String,
    pub summary: String,
    pub score: f64,
    pub matched_via: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveResult {
    pub id: String,
}

/// Tokenize for lexical matching: whole whitespace-delimited segments plus,
/// for any run of CJK characters, overlapping 2-gram and 3-gram substrings
/// (CJK text carries no whitespace word boundaries, so whole-segment
/// tokens alone would never match a sub-phrase).
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for segment in text.split_whitespace() {
        let lower = segment.to_lowercase();
        tokens.push(lower.clone());
        let chars: Vec<char> = lower.chars().collect();
        if chars.iter().any(|c| is_cjk(*c)) {
            for n in [2usize, 3usize] {
                if chars.len() >= n {
                    for w in chars.windows(n) {
                        tokens.push(w.iter().collect());
                    }
                }
            }
        }
    }
    tokens
}

fn is_cjk(c: char) -> bool {
    let cp = c as u32;
    (0x4E00..=0x9FFF).contains(&cp)
        || (0x3040..=0x30FF).contains(&cp)
        || (0xAC00..=0xD7A3).contains(&cp)
}

fn lexical_score(query_tokens: &[String], text: &str) -> f64 {
    let text_tokens = tokenize(text);
    if text_tokens.is_empty() || query_tokens.is_empty() {
        return 0.0;
    }
    let matches = query_tokens
        .iter()
        .filter(|qt| text_tokens.contains(qt))
        .count();
    matches as f64 / query_tokens.len() as f64
}

fn summary_line(text: &str, max_chars: usize) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    let truncated: String = first_line.chars().take(max_chars).collect();
    truncated
}

/// Read the turn pool for a given scope. `Hot`/`Archive` read only their
/// own log; `All` merges both by id with hot winning, matching
/// `read_pool`'s "hot wins" rule.
fn pool_turns(store: &Store, scope: Scope) -> Result<Vec<Turn>> {
    match scope {
        Scope::Hot => hotlog::read_history(store),
        Scope::Archive => archive::read_all_ordered(store),
        Scope::All => {
            let hot = hotlog::read_history(store)?;
            let hot_ids: std::collections::HashSet<String> = hot.iter().map(|t| t.id.clone()).collect();
            let mut turns = hot;
            for t in archive::read_all_ordered(store)? {
                if !hot_ids.contains(&t.id) {
                    turns.push(t);
                }
            }
            turns.sort_by(|a, b| a.ts.cmp(&b.ts));
            Ok(turns)
        }
    }
}

fn session_filter<'a>(turns: &'a [Turn], session: Option<&str>) -> Vec<&'a Turn> {
    turns
        .iter()
        .filter(|t| session.map(|s| t.session_id.as_deref() == Some(s)).unwrap_or(true))
        .collect()
}

/// Lexical-only search over the in-memory turn pool, optionally fused with
/// a vector branch via Reciprocal Rank Fusion when `cfg.retrieval_mode` is
/// `Hybrid`. If the vector branch fails for any reason (no provider, no
/// index), search falls back to lexical-only results rather than erroring.
pub async fn search(
    store: &Store,
    cfg: &Config,
    query: &str,
    k: usize,
    scope: Scope,
    session: Option<&str>,
) -> Result<Vec<SearchHit>> {
    let turns = pool_turns(store, scope)?;
    let pool = session_filter(&turns, session);

    let query_tokens = tokenize(query);
    let mut lexical: Vec<(String, f64)> = pool
        .iter()
        .map(|t| (t.id.clone(), lexical_score(&query_tokens, &t.text)))
        .filter(|(_, score)| *score > 0.0)
        .collect();
    lexical.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    lexical.truncate(cfg.fusion_candidate_max);

    let fused: Vec<(String, f64, Vec<&'static str>)> = if cfg.retrieval_mode == RetrievalMode::Hybrid
        && cfg.vector_enabled
    {
        match vector_branch(store, cfg, query, &pool).await {
            Ok(vector_hits) => fuse_rrf(&lexical, &vector_hits, cfg.fusion_rrf_k),
            Err(_) => lexical
                .iter()
                .map(|(id, score)| (id.clone(), *score, vec!["lexical"]))
                .collect(),
        }
    } else {
        lexical
            .iter()
            .map(|(id, score)| (id.clone(), *score, vec!["lexical"]))
            .collect()
    };

    let by_id: std::collections::HashMap<&str, &Turn> =
        pool.iter().map(|t| (t.id.as_str(), *t)).collect();

    let hits: Vec<SearchHit> = fused
        .into_iter()
        .take(k)
        .filter_map(|(id, score, via)| {
            by_id.get(id.as_str()).map(|t| SearchHit {
                id: t.id.clone(),
                ts: t.ts.clone(),
                role: t.role.as_str().to_string(),
                summary: summary_line(&t.text, cfg.search_summary_max_chars),
                score,
                matched_via: via.into_iter().map(|s| s.to_string()).collect(),
            })
        })
        .collect();

    record_trace(store, cfg, "search", query, hits.len(), None)?;
    State::update(store, cfg.lock_stale_ms, |s| {
        s.search_count += 1;
        s.last_search_hits = Some(hits.len());
        s.last_search_query = Some(query.to_string());
        s.last_search_at = Some(crate::turn::now_rfc3339());
    })?;

    Ok(hits)
}

async fn vector_branch(
    store: &Store,
    cfg: &Config,
    query: &str,
    pool: &[&Turn],
) -> Result<Vec<(String, f64)>> {
    let query_vec = embed_provider::embed_batch(cfg, &[query.to_string()])
        .await?
        .into_iter()
        .next()
        .unwrap_or_default();

    let index_path = cfg
        .index_path
        .as_ref()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| store.path("index.sqlite"));
    let idx = DerivedIndex::open(&index_path, cfg)?;
    let hits = idx.vector_search(&query_vec, cfg.vector_top_n, cfg.vector_min_similarity)?;
    let pool_ids: std::collections::HashSet<&str> = pool.iter().map(|t| t.id.as_str()).collect();
    Ok(hits
        .into_iter()
        .filter(|h| pool_ids.contains(h.id.as_str()))
        .map(|h| (h.id, h.similarity))
        .collect())
}

/// Reciprocal Rank Fusion: score = sum over branches of `1/(k + rank)`.
fn fuse_rrf(
    lexical: &[(String, f64)],
    vector: &[(String, f64)],
    k: u32,
) -> Vec<(String, f64, Vec<&'static str>)> {
    let mut scores: std::collections::HashMap<String, (f64, Vec<&'static str>)> =
        std::collections::HashMap::new();

    for (rank, (id, _)) in lexical.iter().enumerate() {
        let entry = scores.entry(id.clone()).or_insert((0.0, Vec::new()));
        entry.0 += 1.0 / (k as f64 + rank as f64 + 1.0);
        entry.1.push("lexical");
    }
    for (rank, (id, _)) in vector.iter().enumerate() {
        let entry = scores.entry(id.clone()).or_insert((0.0, Vec::new()));
        entry.0 += 1.0 / (k as f64 + rank as f64 + 1.0);
        entry.1.push("vector");
    }

    let mut out: Vec<(String, f64, Vec<&'static str>)> =
        scores.into_iter().map(|(id, (score, via))| (id, score, via)).collect();
    out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// Resolve `id` to the matching turn(s) within `scope`, hot first then
/// archive, tagged with their source. Used by `timeline`/`get` to implement
/// "look in hot first, then archive index" plus id-conflict detection.
fn resolve_matches(store: &Store, scope: Scope, id: &str) -> Result<Vec<(Turn, &'static str)>> {
    let mut matches = Vec::new();
    if scope != Scope::Archive {
        if let Some(t) = hotlog::read_history(store)?.into_iter().find(|t| t.id == id) {
            matches.push((t, "hot"));
        }
    }
    if scope != Scope::Hot {
        if let Some(t) = archive::find_archive_by_id(store, id)? {
            matches.push((t, "archive"));
        }
    }
    Ok(matches)
}

/// Resolve a single anchor turn for `id`, filtering by `session` when given.
/// More than one surviving match after filtering is an unresolvable
/// ambiguity, signaled as `ContextFsError::Conflict` rather than picking
/// one arbitrarily.
fn resolve_anchor(
    store: &Store,
    scope: Scope,
    id: &str,
    session: Option<&str>,
) -> Result<Option<(Turn, &'static str)>> {
    let mut matches = resolve_matches(store, scope, id)?;
    if let Some(s) = session {
        matches.retain(|(t, _)| t.session_id.as_deref() == Some(s));
    }
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.into_iter().next()),
        _ => Err(ContextFsError::Conflict(format!(
            "{id} matches {} turns",
            matches.len()
        ))),
    }
}

/// A window of turns `before`/`after` a given anchor turn id, in chronological
/// order, resolved against the hot-then-archive source the anchor was found
/// in.
pub fn timeline(
    store: &Store,
    cfg: &Config,
    anchor_id: &str,
    before: usize,
    after: usize,
    scope: Scope,
    session: Option<&str>,
) -> Result<Vec<Turn>> {
    let anchor = resolve_anchor(store, scope, anchor_id, session)?;
    let result = match anchor {
        Some((_, source)) => {
            let source_turns = match source {
                "hot" => hotlog::read_history(store)?,
                _ => archive::read_all_ordered(store)?,
            };
            let pos = source_turns.iter().position(|t| t.id == anchor_id);
            match pos {
                Some(idx) => {
                    let start = idx.saturating_sub(before);
                    let end = (idx + after + 1).min(source_turns.len());
                    source_turns[start..end].to_vec()
                }
                None => Vec::new(),
            }
        }
        None => Vec::new(),
    };

    State::update(store, cfg.lock_stale_ms, |s| {
        s.timeline_count += 1;
        s.last_timeline_anchor = Some(anchor_id.to_string());
    })?;
    Ok(result)
}

/// Fetch the full text of a turn by id, truncated to `head_chars` if given
/// (defaults to `cfg.get_default_head`), resolved hot-then-archive within
/// `scope` and optionally filtered by `session`.
pub fn get(
    store: &Store,
    cfg: &Config,
    id: &str,
    head_chars: Option<usize>,
    scope: Scope,
    session: Option<&str>,
) -> Result<Option<Turn>> {
    let head = head_chars.unwrap_or(cfg.get_default_head);
    let mut found = resolve_anchor(store, scope, id, session)?.map(|(t, _)| t);

    if let Some(t) = &mut found {
        if t.text.chars().count() > head {
            t.text = t.text.chars().take(head).collect();
        }
    }

    State::update(store, cfg.lock_stale_ms, |s| {
        s.get_count += 1;
    })?;
    Ok(found)
}

/// Explicitly create a new turn outside of compaction — the primary way an
/// agent deliberately remembers something. Per spec §4.9, a `title` is
/// folded into the stored text as a leading `[title] <t>` line and recorded
/// as a `title:<t>` tag; `role`/`type` default to `assistant`/`note`.
pub async fn save_memory(
    store: &Store,
    cfg: &Config,
    text: &str,
    title: Option<&str>,
    role: Option<&str>,
    kind: Option<&str>,
    session: Option<&str>,
) -> Result<SaveResult> {
    let stored_text = match title {
        Some(t) => format!("[title] {t}\n{text}"),
        None => text.to_string(),
    };
    let mut tags = Vec::new();
    if let Some(t) = title {
        tags.push(format!("title:{t}"));
    }

    let raw = crate::turn::RawTurn {
        id: None,
        ts: None,
        session_id: session.map(str::to_string),
        role: Some(role.unwrap_or("assistant").to_string()),
        kind: Some(kind.unwrap_or("note").to_string()),
        tags,
        text: stored_text,
    };

    let existing = hotlog::read_history(store)?;
    let mut seen_ids: std::collections::HashSet<String> =
        existing.iter().map(|t| t.id.clone()).collect();
    let epoch_ms = crate::turn::epoch_ms_now();
    let turn = crate::turn::normalize(raw, existing.len() as u64, epoch_ms, &mut seen_ids);

    hotlog::append_with_embedding(store, cfg, &turn).await?;
    Ok(SaveResult { id: turn.id })
}

fn record_trace(
    store: &Store,
    cfg: &Config,
    op: &str,
    query: &str,
    hit_count: usize,
    error: Option<String>,
) -> Result<()> {
    let truncated_query: String = query.chars().take(cfg.trace_query_max_chars).collect();
    traces::append_trace(
        store,
        cfg,
        &RetrievalTrace {
            id: format!("trace-{}", crate::embedding::text_hash(&format!("{op}{query}{}", crate::turn::now_rfc3339()))[..12].to_string()),
            ts: crate::turn::now_rfc3339(),
            op: op.to_string(),
            query: truncated_query,
            hit_count,
            error,
        },
    )
}

/// A fixed-size bucket describing how much of a result was shown, used by
/// the `get`/`search` JSON output to hint at truncation without repeating
/// the full token-count math everywhere.
pub fn size_bucket(tokens: usize) -> &'static str {
    match tokens {
        0..=200 => "small",
        201..=2000 => "medium",
        _ => "large",
    }
}
