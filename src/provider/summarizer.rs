/// External summarizer provider used by the compactor's phase 2. The real
/// LLM call is explicitly out of scope (spec Non-goals); what's implemented
/// here is the pluggable contract plus a deterministic fake used by tests
/// and by `auto_compact` when no `compact_model` endpoint is configured.
///
/// HTTP shape grounded on the teacher's `client.rs::Client::chat` (reqwest,
/// JSON body, Bearer auth), simplified to a single non-streaming call.
use crate::error::{ContextFsError, Result};
use crate::turn::Turn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct SummarizeRequest<'a> {
    model: &'a str,
    turns: Vec<TurnForPrompt<'a>>,
}

#[derive(Debug, Serialize)]
struct TurnForPrompt<'a> {
    role: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SummarizeResponse {
    bullets: Vec<String>,
}

pub async fn summarize(
    base_url: Option<&str>,
    api_key: Option<&str>,
    model: &str,
    timeout_ms: u64,
    max_retries: u32,
    turns: &[Turn],
) -> Result<Vec<String>> {
    match base_url {
        None => Ok(fake_summarize(turns)),
        Some(url) => http_summarize(url, api_key, model, timeout_ms, max_retries, turns).await,
    }
}

/// Deterministic summarizer: one bullet per distinct (role, first line)
/// pair, capped to keep the fallback path cheap to test against.
fn fake_summarize(turns: &[Turn]) -> Vec<String> {
    turns
        .iter()
        .map(|t| {
            let first_line = t.text.lines().next().unwrap_or("").trim();
            let truncated: String = first_line.chars().take(120).collect();
            format!("- [{:?}] {truncated}", t.role)
        })
        .collect()
}

async fn http_summarize(
    base_url: &str,
    api_key: Option<&str>,
    model: &str,
    timeout_ms: u64,
    max_retries: u32,
    turns: &[Turn],
) -> Result<Vec<String>> {
    let client = reqwest::Client::new();
    let body = SummarizeRequest {
        model,
        turns: turns
            .iter()
            .map(|t| TurnForPrompt {
                role: match t.role {
                    crate::turn::Role::User => "user",
                    crate::turn::Role::Assistant => "assistant",
                    crate::turn::Role::System => "system",
                    crate::turn::Role::Tool => "tool",
                },
                text: &t.text,
            })
            .collect(),
    };

    let mut attempt = 0u32;
    loop {
        let mut req = client
            .post(base_url)
            .json(&body)
            .timeout(std::time::Duration::from_millis(timeout_ms));
        if let Some(key) = api_key {
            req = req.bearer_auth(key);
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                let parsed: SummarizeResponse = resp
                    .json()
                    .await
                    .map_err(|e| ContextFsError::Provider(format!("bad response: {e}")))?;
                return Ok(parsed.bullets);
            }
            Ok(resp) if attempt < max_retries && resp.status().is_server_error() => {
                attempt += 1;
                continue;
            }
            Ok(resp) => {
                return Err(ContextFsError::Provider(format!(
                    "summarizer request failed: {}",
                    resp.status()
                )));
            }
            Err(e) if attempt < max_retries && e.is_timeout() => {
                attempt += 1;
                continue;
            }
            Err(e) => return Err(ContextFsError::Provider(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::Role;

    fn turn(role: Role, text: &str) -> Turn {
        Turn {
            id: "t".to_string(),
            ts: "2026-01-01T00:00:00Z".to_string(),
            session_id: None,
            role,
            kind: None,
            refs: vec![],
            tags: vec![],
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn no_base_url_uses_fake_summarizer() {
        let turns = vec![turn(Role::User, "hello\nmore"), turn(Role::Assistant, "hi")];
        let bullets = summarize(None, None, "m", 1000, 0, &turns).await.unwrap();
        assert_eq!(bullets.len(), 2);
        assert!(bullets[0].contains("hello"));
    }

    #[test]
    fn fake_summarize_truncates_long_lines() {
        let long_text = "x".repeat(300);
        let turns = vec![turn(Role::User, &long_text)];
        let bullets = fake_summarize(&turns);
        assert!(bullets[0].len() < 300);
    }
}
