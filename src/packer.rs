/// The packer: assembles the `<<<BEGIN>>>`/`<<<END>>>` context block injected
/// into an agent's prompt, shrinking it through staged steps until it fits
/// the caller's token budget.
///
/// Directly grounded on `budget.rs::Budget::enforce`'s two-pass compression
/// strategy (compress tool results, then trim oldest turns), generalized to
/// the spec's seven-stage shrink order and five sections (pins, summary,
/// manifest, retrieval index, worked-set recent turns).
use crate::config::Config;
use crate::manifest;
use crate::pins;
use crate::state::State;
use crate::summary;
use crate::tokens::estimate_tokens;
use crate::turn::Turn;
use crate::fsstore::Store;
use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct TokenBreakdown {
    pub pins: usize,
    pub summary: usize,
    pub manifest: usize,
    pub retrieval_index: usize,
    pub recent_turns: usize,
}

impl TokenBreakdown {
    pub fn total(&self) -> usize {
        self.pins + self.summary + self.manifest + self.retrieval_index + self.recent_turns
    }
}

#[derive(Debug, Clone)]
pub struct PackResult {
    pub block: String,
    pub tokens: usize,
    pub mode: PackMode,
    pub details: TokenBreakdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackMode {
    Full,
    Shrunk,
    Minimal,
    Emergency,
}

/// Largest char-boundary index `<= idx`, so truncation never splits a
/// multi-byte UTF-8 sequence (`str::floor_char_boundary` is nightly-only).
fn floor_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    let mut i = idx;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn sanitize(text: &str, start: &str, end: &str) -> String {
    text.replace(start, "[[CONTEXTFS_BEGIN_ESCAPED]]")
        .replace(end, "[[CONTEXTFS_END_ESCAPED]]")
}

/// Build the pack block for `budget_tokens`, applying the seven-stage
/// progressive shrink until it fits (or the emergency floor is reached):
/// 1. decrement the number of kept recent turns
/// 2. drop retrieval index rows
/// 3. shrink the summary
/// 4. shrink the manifest
/// 5. shrink pins
/// 6. collapse to minimal mode (pins + one-line summary only)
/// 7. emergency mode: a single hard-truncated line
pub fn build(
    store: &Store,
    cfg: &Config,
    state: &State,
    recent_turns: &[Turn],
    retrieval_index_lines: &[String],
    budget_tokens: usize,
) -> Result<PackResult> {
    let mut kept_recent = recent_turns.len().min(cfg.recent_turns);
    let mut retrieval_cap = retrieval_index_lines.len().min(cfg.retrieval_index_max_items);
    let mut summary_cap = cfg.summary_max_chars;
    let mut manifest_cap = cfg.manifest_max_lines;
    let mut pins_list = pins::read_all(store)?;

    loop {
        let rendered = render(
            store,
            cfg,
            state,
            recent_turns,
            kept_recent,
            retrieval_index_lines,
            retrieval_cap,
            summary_cap,
            manifest_cap,
            &pins_list,
        )?;

        if rendered.details.total() <= budget_tokens {
            return Ok(PackResult {
                block: rendered.block,
                tokens: rendered.details.total(),
                mode: PackMode::Full,
                details: rendered.details,
            });
        }

        if kept_recent > 0 {
            kept_recent -= 1;
            continue;
        }
        if retrieval_cap > 0 {
            retrieval_cap -= 1;
            continue;
        }
        if summary_cap > cfg.pack_summary_min_chars {
            summary_cap = (summary_cap / 2).max(cfg.pack_summary_min_chars);
            continue;
        }
        if manifest_cap > 4 {
            manifest_cap = (manifest_cap / 2).max(4);
            continue;
        }
        if pins_list.len() > 1 {
            pins_list.truncate(pins_list.len() / 2);
            continue;
        }

        if rendered.details.total() > budget_tokens {
            let minimal = render_minimal(store, cfg, budget_tokens)?;
            if estimate_tokens(&minimal) <= budget_tokens {
                return Ok(PackResult {
                    block: minimal.clone(),
                    tokens: estimate_tokens(&minimal),
                    mode: PackMode::Minimal,
                    details: TokenBreakdown {
                        pins: estimate_tokens(&minimal),
                        ..Default::default()
                    },
                });
            }
            let emergency = render_emergency(cfg, budget_tokens);
            return Ok(PackResult {
                tokens: estimate_tokens(&emergency),
                block: emergency,
                mode: PackMode::Emergency,
                details: TokenBreakdown::default(),
            });
        }

        return Ok(PackResult {
            block: rendered.block,
            tokens: rendered.details.total(),
            mode: PackMode::Shrunk,
            details: rendered.details,
        });
    }
}

struct Rendered {
    block: String,
    details: TokenBreakdown,
}

#[allow(clippy::too_many_arguments)]
fn render(
    store: &Store,
    cfg: &Config,
    state: &State,
    recent_turns: &[Turn],
    kept_recent: usize,
    retrieval_index_lines: &[String],
    retrieval_cap: usize,
    summary_cap: usize,
    manifest_cap: usize,
    pins_list: &[pins::Pin],
) -> Result<Rendered> {
    let pins_section = pins_list
        .iter()
        .map(|p| format!("- {}", p.text))
        .collect::<Vec<_>>()
        .join("\n");

    let mut summary_doc = summary::read(store)?;
    if summary_doc.len() > summary_cap {
        summary_doc.truncate(floor_char_boundary(&summary_doc, summary_cap));
    }

    let manifest_doc = manifest::render(cfg, state, manifest_cap);

    let retrieval_section = retrieval_index_lines
        .iter()
        .take(retrieval_cap)
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");

    let start = recent_turns.len().saturating_sub(kept_recent);
    let recent_section = recent_turns[start..]
        .iter()
        .map(|t| format!("[{:?}] {}", t.role, sanitize(&t.text, &cfg.pack_delimiter_start, &cfg.pack_delimiter_end)))
        .collect::<Vec<_>>()
        .join("\n");

    let details = TokenBreakdown {
        pins: estimate_tokens(&pins_section),
        summary: estimate_tokens(&summary_doc),
        manifest: estimate_tokens(&manifest_doc),
        retrieval_index: estimate_tokens(&retrieval_section),
        recent_turns: estimate_tokens(&recent_section),
    };

    let block = format!(
        "{start_delim}\n## ContextFS Pack\n\n### PINS\n{pins_section}\n\n### SUMMARY\n{summary_doc}\n\n### MANIFEST\n{manifest_doc}\n\n### RETRIEVAL_INDEX\n{retrieval_section}\n\n### WORKSET_RECENT_TURNS\n{recent_section}\n{end_delim}\n",
        start_delim = cfg.pack_delimiter_start,
        end_delim = cfg.pack_delimiter_end,
    );

    Ok(Rendered { block, details })
}

fn render_minimal(store: &Store, cfg: &Config, _budget: usize) -> Result<String> {
    let pins_list = pins::read_all(store)?;
    let pins_line = pins_list.first().map(|p| p.text.clone()).unwrap_or_default();
    Ok(format!(
        "{}\n## ContextFS Pack\n\n### PINS\n- {pins_line}\n{}\n",
        cfg.pack_delimiter_start, cfg.pack_delimiter_end
    ))
}

fn render_emergency(cfg: &Config, budget: usize) -> String {
    let mut line = format!("{} context unavailable (budget too small) {}", cfg.pack_delimiter_start, cfg.pack_delimiter_end);
    while estimate_tokens(&line) > budget.max(1) && line.len() > 8 {
        line.truncate(line.len() - 8);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::Role;

    fn turn(id: &str, text: &str) -> Turn {
        Turn {
            id: id.to_string(),
            ts: "2026-01-01T00:00:00Z".to_string(),
            session_id: None,
            role: Role::User,
            kind: None,
            refs: vec![],
            tags: vec![],
            text: text.to_string(),
        }
    }

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join(".contextfs")).unwrap();
        (dir, store)
    }

    #[test]
    fn fits_within_budget_uses_full_mode() {
        let (_dir, store) = open_store();
        let cfg = Config::default();
        let state = State::default();
        let turns = vec![turn("a", "hello world")];
        let result = build(&store, &cfg, &state, &turns, &[], 10_000).unwrap();
        assert_eq!(result.mode, PackMode::Full);
        assert!(result.block.contains("WORKSET_RECENT_TURNS"));
    }

    #[test]
    fn tiny_budget_forces_emergency_or_minimal() {
        let (_dir, store) = open_store();
        let cfg = Config::default();
        let state = State::default();
        let turns: Vec<Turn> = (0..30).map(|i| turn(&format!("t{i}"), &"word ".repeat(50))).collect();
        let result = build(&store, &cfg, &state, &turns, &[], 5).unwrap();
        assert!(matches!(result.mode, PackMode::Minimal | PackMode::Emergency));
    }

    #[test]
    fn delimiters_in_turn_text_are_sanitized() {
        let (_dir, store) = open_store();
        let cfg = Config::default();
        let state = State::default();
        let turns = vec![turn("a", "here is <<<BEGIN>>> injected")];
        let result = build(&store, &cfg, &state, &turns, &[], 10_000).unwrap();
        let body_without_wrapper = &result.block[cfg.pack_delimiter_start.len()..result.block.len() - cfg.pack_delimiter_end.len() - 1];
        assert!(!body_without_wrapper.contains(&cfg.pack_delimiter_start));
    }
}
