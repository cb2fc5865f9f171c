/// The manifest: a regenerated-on-demand markdown listing of store files,
/// mode settings, and the current state revision. Never parsed back — it
/// exists purely to be injected into the pack block so an agent can see
/// what's on disk without running `ctx ls` itself.
use crate::config::Config;
use crate::state::State;

pub fn render(cfg: &Config, state: &State, max_lines: usize) -> String {
    let mut lines = vec![
        "# Manifest".to_string(),
        String::new(),
        format!("revision: {}", state.revision),
        format!("retrievalMode: {:?}", cfg.retrieval_mode).to_lowercase(),
        format!("vectorEnabled: {}", cfg.vector_enabled),
        String::new(),
        "## Files".to_string(),
        "- pins.md".to_string(),
        "- summary.md".to_string(),
        "- history.ndjson".to_string(),
        "- archive.ndjson".to_string(),
    ];
    if cfg.index_enabled {
        lines.push("- index.sqlite".to_string());
    }
    if cfg.traces_enabled {
        lines.push("- traces/".to_string());
    }
    lines.truncate(max_lines);
    lines.join("\n") + "\n"
}
