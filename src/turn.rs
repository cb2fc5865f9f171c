/// The `Turn` entity and its normalization rules.
///
/// Generalizes the teacher's `sessions.rs::ConversationTurn` (which only
/// knows `user_message`/`agent_response`/`tool_summary` for a single
/// session) into the spec's hot/archive-scoped `Turn`, which can originate
/// from arbitrary upstream logs with inconsistent role names and missing
/// timestamps or ids.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
    Note,
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
            Role::Note => "note",
            Role::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub role: Role,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub text: String,
}

/// Raw, untrusted fields as they arrive from an upstream log line, before
/// normalization fills in role/ts/id/refs.
#[derive(Debug, Default, Clone)]
pub struct RawTurn {
    pub id: Option<String>,
    pub ts: Option<String>,
    pub session_id: Option<String>,
    pub role: Option<String>,
    pub kind: Option<String>,
    pub tags: Vec<String>,
    pub text: String,
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn epoch_ms_now() -> i64 {
    Utc::now().timestamp_millis()
}

/// Loosely parse one JSON line into a `RawTurn`. Unlike strict `Turn`
/// deserialization this only requires a `text` field to be present as a
/// string; every other field is optional and defaulted, matching spec
/// §4.3's "each successfully parsed line is normalized" — parsing here is
/// deliberately permissive, normalization does the rest.
pub fn loose_parse(value: &Value) -> Option<RawTurn> {
    let text = value.get("text").and_then(|v| v.as_str())?.to_string();
    Some(RawTurn {
        id: value.get("id").and_then(|v| v.as_str()).map(str::to_string),
        ts: value.get("ts").and_then(|v| v.as_str()).map(str::to_string),
        session_id: value
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        role: value.get("role").and_then(|v| v.as_str()).map(str::to_string),
        kind: value
            .get("type")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        tags: value
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
        text,
    })
}

/// Fold a free-form role string into the canonical `Role`. Unrecognized
/// roles fall back to `Unknown` rather than being treated as `Tool` — an
/// unrecognized role carries no information about whether it's a side
/// channel or conversational content.
fn fold_role(raw: &str) -> Role {
    match raw.to_ascii_lowercase().as_str() {
        "user" | "human" => Role::User,
        "assistant" | "ai" | "bot" | "model" => Role::Assistant,
        "system" => Role::System,
        "tool" => Role::Tool,
        "note" => Role::Note,
        _ => Role::Unknown,
    }
}

/// Infer a `type` for a turn lacking one. This is a coarse heuristic over
/// the normalized role, not content analysis — good enough to populate the
/// spec's `query|response|tool_output|artifact|note` set deterministically.
fn infer_kind(role: &Role) -> String {
    match role {
        Role::User => "query",
        Role::Assistant => "response",
        Role::Tool => "tool_output",
        Role::System => "artifact",
        Role::Note => "note",
        Role::Unknown => "note",
    }
    .to_string()
}

const CODE_DOC_SUFFIXES: [&str; 16] = [
    ".rs", ".py", ".js", ".ts", ".tsx", ".jsx", ".go", ".java", ".c", ".cpp", ".h", ".md", ".toml",
    ".json", ".yaml", ".yml",
];

/// Infer `refs` entries from raw, untagged text: `http(s)://…` URLs, file
/// paths ending in a known code/doc suffix (unix or windows separators),
/// `Name(` function-call syntax, and `#nnn` issue numbers. Results are
/// deduped and capped at ten.
fn infer_refs(text: &str) -> Vec<String> {
    let mut refs = Vec::new();
    for raw_token in text.split_whitespace() {
        let token = raw_token.trim_matches(|c: char| matches!(c, '"' | '\'' | ',' | ';' | '.'));
        if token.is_empty() {
            continue;
        }

        if token.starts_with("http://") || token.starts_with("https://") {
            refs.push(format!("url:{token}"));
            continue;
        }

        if let Some(digits) = token.strip_prefix('#') {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                refs.push(format!("issue:#{digits}"));
                continue;
            }
        }

        if CODE_DOC_SUFFIXES.iter().any(|sfx| raw_token.ends_with(sfx)) {
            refs.push(format!("file:{token}"));
            continue;
        }

        if let Some(open) = token.find('(') {
            let (name, rest) = token.split_at(open);
            if rest.ends_with(')')
                && !name.is_empty()
                && name
                    .chars()
                    .next()
                    .map(|c| c.is_alphabetic() || c == '_')
                    .unwrap_or(false)
                && name.chars().all(|c| c.is_alphanumeric() || c == '_')
            {
                refs.push(format!("fn:{name}"));
                continue;
            }
        }
    }
    refs.sort();
    refs.dedup();
    refs.truncate(10);
    refs
}

fn content_hash_id(session_id: Option<&str>, role: &Role, ts: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.unwrap_or(""));
    hasher.update(b"\0");
    hasher.update(format!("{role:?}"));
    hasher.update(b"\0");
    hasher.update(ts);
    hasher.update(b"\0");
    hasher.update(text);
    let digest = hasher.finalize();
    format!("H-{:x}", digest)[..18].to_string()
}

/// Normalize a `RawTurn` into a canonical `Turn`.
///
/// - `role` is folded via [`fold_role`]; missing role folds to `Unknown`.
/// - `ts` falls back to `epoch + line_index` milliseconds when absent, so
///   lines without a timestamp still sort deterministically relative to
///   their position in the source log.
/// - `type` is inferred from the normalized role when not already supplied.
/// - `refs` are inferred from `text` when not already supplied.
/// - `id` is derived from a content hash when absent; `seen_ids` is used to
///   append a `-1`, `-2`, … suffix on collision (two turns can legitimately
///   hash to the same digest, e.g. the same message repeated verbatim).
pub fn normalize(
    raw: RawTurn,
    line_index: u64,
    epoch_ms: i64,
    seen_ids: &mut std::collections::HashSet<String>,
) -> Turn {
    let role = match raw.role.as_deref() {
        Some(r) => fold_role(r),
        None => Role::Unknown,
    };
    let ts = raw.ts.unwrap_or_else(|| {
        let millis = epoch_ms + line_index as i64;
        DateTime::from_timestamp_millis(millis)
            .unwrap_or_else(Utc::now)
            .to_rfc3339()
    });
    let kind = raw.kind.or_else(|| Some(infer_kind(&role)));
    let refs = infer_refs(&raw.text);

    let id = raw.id.unwrap_or_else(|| {
        let base = content_hash_id(raw.session_id.as_deref(), &role, &ts, &raw.text);
        dedupe_id(base, seen_ids)
    });
    seen_ids.insert(id.clone());

    Turn {
        id,
        ts,
        session_id: raw.session_id,
        role,
        kind,
        refs,
        tags: raw.tags,
        text: raw.text,
    }
}

fn dedupe_id(base: String, seen: &std::collections::HashSet<String>) -> String {
    if !seen.contains(&base) {
        return base;
    }
    let mut n = 1u32;
    loop {
        let candidate = format!("{base}-{n}");
        if !seen.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
