/// Configuration — recognized options and their effects (spec §6).
///
/// Shaped after the teacher's `config.rs`: a serde-derived file struct with
/// `#[serde(default = "…")]` per field, loaded from TOML, merged with CLI
/// overrides into a `ResolvedConfig`-style struct (here just `Config`, since
/// ContextFS has no per-profile concept). `write_default_if_missing` mirrors
/// `ConfigFile::write_default_if_missing`.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    Lexical,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorProvider {
    None,
    Fake,
    Custom,
    Siliconflow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    pub auto_inject: bool,
    pub auto_compact: bool,
    pub contextfs_dir: String,

    pub recent_turns: usize,
    pub token_threshold: usize,
    pub pins_max_items: usize,
    pub summary_max_chars: usize,
    pub manifest_max_lines: usize,
    pub pin_scan_max_chars: usize,
    pub lock_stale_ms: u64,

    pub search_default_k: usize,
    pub search_summary_max_chars: usize,
    pub timeline_before_default: usize,
    pub timeline_after_default: usize,
    pub retrieval_index_max_items: usize,
    pub pack_summary_min_chars: usize,
    pub get_default_head: usize,

    pub traces_enabled: bool,
    pub traces_max_bytes: u64,
    pub traces_max_files: usize,
    pub traces_tail_default: usize,
    pub trace_ranking_max_items: usize,
    pub trace_query_max_chars: usize,

    pub pack_delimiter_start: String,
    pub pack_delimiter_end: String,

    pub retrieval_mode: RetrievalMode,
    pub vector_enabled: bool,
    pub vector_provider: VectorProvider,
    pub vector_dim: usize,
    pub embedding_text_max_chars: usize,
    pub embedding_batch_size: usize,
    pub embedding_model: String,
    pub embedding_base_url: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_timeout_ms: u64,
    pub embedding_max_retries: u32,

    pub compact_model: String,
    pub compact_timeout_ms: u64,
    pub compact_max_retries: u32,

    pub fusion_rrf_k: u32,
    pub fusion_candidate_max: usize,
    pub vector_top_n: usize,
    pub vector_min_similarity: f64,
    pub ann_top_n: usize,
    pub ann_probe_top_n: usize,

    pub index_enabled: bool,
    pub index_path: Option<String>,
    pub embedding_hot_max_bytes: u64,
    pub embedding_archive_max_bytes: u64,
    pub embedding_dup_ratio_threshold: f64,
    pub embedding_auto_compact: bool,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_inject: true,
            auto_compact: true,
            contextfs_dir: ".contextfs".to_string(),

            recent_turns: 12,
            token_threshold: 6000,
            pins_max_items: 50,
            summary_max_chars: 4000,
            manifest_max_lines: 40,
            pin_scan_max_chars: 4000,
            lock_stale_ms: 30_000,

            search_default_k: 10,
            search_summary_max_chars: 160,
            timeline_before_default: 3,
            timeline_after_default: 3,
            retrieval_index_max_items: 10,
            pack_summary_min_chars: 256,
            get_default_head: 4000,

            traces_enabled: true,
            traces_max_bytes: 2_000_000,
            traces_max_files: 5,
            traces_tail_default: 20,
            trace_ranking_max_items: 20,
            trace_query_max_chars: 200,

            pack_delimiter_start: "<<<BEGIN>>>".to_string(),
            pack_delimiter_end: "<<<END>>>".to_string(),

            retrieval_mode: RetrievalMode::Lexical,
            vector_enabled: false,
            vector_provider: VectorProvider::None,
            vector_dim: 256,
            embedding_text_max_chars: 4000,
            embedding_batch_size: 16,
            embedding_model: "fake-embed-v1".to_string(),
            embedding_base_url: None,
            embedding_api_key: None,
            embedding_timeout_ms: 20_000,
            embedding_max_retries: 2,

            compact_model: "compact-v1".to_string(),
            compact_timeout_ms: 20_000,
            compact_max_retries: 2,

            fusion_rrf_k: 60,
            fusion_candidate_max: 50,
            vector_top_n: 20,
            vector_min_similarity: 0.35,
            ann_top_n: 20,
            ann_probe_top_n: 40,

            index_enabled: true,
            index_path: None,
            embedding_hot_max_bytes: 5_000_000,
            embedding_archive_max_bytes: 50_000_000,
            embedding_dup_ratio_threshold: 0.3,
            embedding_auto_compact: true,

            debug: false,
        }
    }
}

impl Config {
    /// Load a `contextfs.toml` from `workspace_dir` if present, else defaults.
    /// Also seeds process environment from a sibling `.env` file (spec §6).
    pub fn load(workspace_dir: &Path) -> anyhow::Result<Self> {
        load_dotenv_sibling(workspace_dir);

        let path = workspace_dir.join("contextfs.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let cfg: Self = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Bounds-check the handful of options the spec gives explicit ranges for.
    pub fn validate(&self) -> anyhow::Result<()> {
        fn in_range<T: PartialOrd + std::fmt::Display>(
            name: &str,
            v: T,
            lo: T,
            hi: T,
        ) -> anyhow::Result<()> {
            if v < lo || v > hi {
                anyhow::bail!("{name} must be in [{lo}, {hi}], got {v}");
            }
            Ok(())
        }
        in_range("recentTurns", self.recent_turns, 1, 64)?;
        in_range("tokenThreshold", self.token_threshold, 256, 200_000)?;
        in_range("pinsMaxItems", self.pins_max_items, 1, 200)?;
        in_range("summaryMaxChars", self.summary_max_chars, 256, 20_000)?;
        in_range("manifestMaxLines", self.manifest_max_lines, 8, 200)?;
        in_range("lockStaleMs", self.lock_stale_ms, 1000, 600_000)?;
        in_range("searchDefaultK", self.search_default_k, 1, 50)?;
        in_range(
            "searchSummaryMaxChars",
            self.search_summary_max_chars,
            40,
            400,
        )?;
        in_range(
            "retrievalIndexMaxItems",
            self.retrieval_index_max_items,
            0,
            50,
        )?;
        in_range("tracesMaxBytes", self.traces_max_bytes, 1024, 50_000_000)?;
        in_range("tracesMaxFiles", self.traces_max_files, 1, 10)?;
        in_range("vectorDim", self.vector_dim, 8, 4096)?;
        if self.pack_delimiter_start == self.pack_delimiter_end {
            anyhow::bail!("packDelimiterStart and packDelimiterEnd must differ");
        }
        if self.pack_delimiter_start.len() > 128 || self.pack_delimiter_end.len() > 128 {
            anyhow::bail!("pack delimiters must be <= 128 chars");
        }
        Ok(())
    }

    pub fn contextfs_dir_path(&self, workspace_dir: &Path) -> PathBuf {
        workspace_dir.join(&self.contextfs_dir)
    }
}

/// Parse `KEY=VALUE` lines from a sibling `.env` file and set them in the
/// process environment, skipping keys that are already set. Hand-rolled to
/// match the teacher's own hand-rolled config parsing style rather than
/// pulling in a dotenv crate for four lines of logic.
fn load_dotenv_sibling(workspace_dir: &Path) {
    let path = workspace_dir.join(".env");
    let Ok(raw) = fs::read_to_string(&path) else {
        return;
    };
    for (key, value) in parse_dotenv(&raw) {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(key, value);
        }
    }
}

fn parse_dotenv(raw: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim().to_string();
        if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
            || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
        {
            value = value[1..value.len() - 1].to_string();
        }
        out.push((key.to_string(), value));
    }
    out
}

/// Map of configured option name -> raw TOML value, used only for `ctx ls`
/// to render a human-readable settings dump without re-deriving `Display`
/// for every field.
pub fn as_display_map(cfg: &Config) -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert("enabled".into(), cfg.enabled.to_string());
    m.insert("autoInject".into(), cfg.auto_inject.to_string());
    m.insert("autoCompact".into(), cfg.auto_compact.to_string());
    m.insert("recentTurns".into(), cfg.recent_turns.to_string());
    m.insert("tokenThreshold".into(), cfg.token_threshold.to_string());
    m.insert(
        "retrievalMode".into(),
        format!("{:?}", cfg.retrieval_mode).to_lowercase(),
    );
    m.insert("vectorEnabled".into(), cfg.vector_enabled.to_string());
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_recent_turns_rejected() {
        let mut cfg = Config::default();
        cfg.recent_turns = 0;
        assert!(cfg.validate().is_err());
        cfg.recent_turns = 65;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn equal_delimiters_rejected() {
        let mut cfg = Config::default();
        cfg.pack_delimiter_end = cfg.pack_delimiter_start.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn dotenv_parses_quoted_and_export() {
        let raw = "export FOO=bar\nBAZ=\"qux\"\n# comment\n\nEMPTY=\n";
        let parsed = parse_dotenv(raw);
        assert_eq!(
            parsed,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("BAZ".to_string(), "qux".to_string()),
                ("EMPTY".to_string(), "".to_string()),
            ]
        );
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.recent_turns, Config::default().recent_turns);
    }

    #[test]
    fn load_parses_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("contextfs.toml"),
            "recent_turns = 20\ntoken_threshold = 8000\n",
        )
        .unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.recent_turns, 20);
        assert_eq!(cfg.token_threshold, 8000);
    }
}
