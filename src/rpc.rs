/// Stdio JSON-RPC 2.0 tool server exposing `search`, `timeline`, `get`,
/// `save_memory`, and `__IMPORTANT` (a static instructions blob a host can
/// fetch once at startup).
///
/// Grounded directly on `mcp.rs`, which already implements the client half
/// of this exact protocol (`Request`/`Response`/`RpcError`, newline-
/// delimited stdin/stdout, line-buffered read loop). This module is the
/// server-side mirror: read a line, parse a `Request`, dispatch, write a
/// `Response` line.
use crate::config::Config;
use crate::error::Result as CtxResult;
use crate::fsstore::Store;
use crate::retrieval::{self, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Deserialize)]
struct Request {
    jsonrpc: String,
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct Response {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

const IMPORTANT_TEXT: &str = "ContextFS tools operate on the current workspace's .contextfs directory. \
Call `search` before assuming something isn't in memory; call `save_memory` to persist a fact \
outside of normal compaction.";

/// Run the server loop over the given stdin/stdout, returning when stdin is
/// closed. `store`/`cfg` are shared across requests — there is one workspace
/// per process, matching the CLI's model.
pub async fn serve<R, W>(store: &Store, cfg: &Config, mut input: R, mut output: W) -> CtxResult<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(&mut input);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await.map_err(crate::error::ContextFsError::Io)?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(req) => handle(store, cfg, req).await,
            Err(e) => Response {
                jsonrpc: "2.0",
                id: Value::Null,
                result: None,
                error: Some(RpcError {
                    code: -32700,
                    message: format!("parse error: {e}"),
                }),
            },
        };

        let mut out_line = serde_json::to_string(&response).map_err(crate::error::ContextFsError::from)?;
        out_line.push('\n');
        output
            .write_all(out_line.as_bytes())
            .await
            .map_err(crate::error::ContextFsError::Io)?;
        output.flush().await.map_err(crate::error::ContextFsError::Io)?;
    }
    Ok(())
}

async fn handle(store: &Store, cfg: &Config, req: Request) -> Response {
    if req.jsonrpc != "2.0" {
        return Response {
            jsonrpc: "2.0",
            id: req.id,
            result: None,
            error: Some(RpcError {
                code: -32600,
                message: "invalid jsonrpc version".to_string(),
            }),
        };
    }

    let result = match req.method.as_str() {
        "search" => dispatch_search(store, cfg, &req.params).await,
        "timeline" => dispatch_timeline(store, cfg, &req.params),
        "get" => dispatch_get(store, cfg, &req.params),
        "save_memory" => dispatch_save_memory(store, cfg, &req.params).await,
        "__IMPORTANT" => Ok(serde_json::json!({ "text": IMPORTANT_TEXT })),
        other => Err(format!("unknown method: {other}")),
    };

    match result {
        Ok(value) => Response {
            jsonrpc: "2.0",
            id: req.id,
            result: Some(value),
            error: None,
        },
        Err(message) => Response {
            jsonrpc: "2.0",
            id: req.id,
            result: None,
            error: Some(RpcError { code: -32000, message }),
        },
    }
}

fn parse_scope(params: &Value) -> std::result::Result<Scope, String> {
    match params.get("scope").and_then(|v| v.as_str()) {
        Some(s) => Scope::from_str(s).map_err(|e| e.to_string()),
        None => Ok(Scope::All),
    }
}

async fn dispatch_search(store: &Store, cfg: &Config, params: &Value) -> std::result::Result<Value, String> {
    let query = params.get("query").and_then(|v| v.as_str()).ok_or("missing `query`")?;
    let k = params.get("k").and_then(|v| v.as_u64()).map(|v| v as usize);
    let scope = parse_scope(params)?;
    let session = params.get("session").and_then(|v| v.as_str());
    let hits = retrieval::search(store, cfg, query, k.unwrap_or(cfg.search_default_k), scope, session)
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_value(hits).map_err(|e| e.to_string())
}

fn dispatch_timeline(store: &Store, cfg: &Config, params: &Value) -> std::result::Result<Value, String> {
    let anchor_id = params.get("id").and_then(|v| v.as_str()).ok_or("missing `id`")?;
    let before = params.get("before").and_then(|v| v.as_u64()).map(|v| v as usize);
    let after = params.get("after").and_then(|v| v.as_u64()).map(|v| v as usize);
    let scope = parse_scope(params)?;
    let session = params.get("session").and_then(|v| v.as_str());
    let turns = retrieval::timeline(
        store,
        cfg,
        anchor_id,
        before.unwrap_or(cfg.timeline_before_default),
        after.unwrap_or(cfg.timeline_after_default),
        scope,
        session,
    )
    .map_err(|e| e.to_string())?;
    serde_json::to_value(turns).map_err(|e| e.to_string())
}

fn dispatch_get(store: &Store, cfg: &Config, params: &Value) -> std::result::Result<Value, String> {
    let id = params.get("id").and_then(|v| v.as_str()).ok_or("missing `id`")?;
    let head = params.get("head").and_then(|v| v.as_u64()).map(|v| v as usize);
    let scope = parse_scope(params)?;
    let session = params.get("session").and_then(|v| v.as_str());
    let turn = retrieval::get(store, cfg, id, head, scope, session).map_err(|e| e.to_string())?;
    serde_json::to_value(turn).map_err(|e| e.to_string())
}

async fn dispatch_save_memory(store: &Store, cfg: &Config, params: &Value) -> std::result::Result<Value, String> {
    let text = params.get("text").and_then(|v| v.as_str()).ok_or("missing `text`")?;
    let title = params.get("title").and_then(|v| v.as_str());
    let role = params.get("role").and_then(|v| v.as_str());
    let kind = params.get("type").and_then(|v| v.as_str());
    let session = params.get("session").and_then(|v| v.as_str());
    let result = retrieval::save_memory(store, cfg, text, title, role, kind, session)
        .await
        .map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "id": result.id }))
}
