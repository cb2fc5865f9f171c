/// Embedding providers: turn text into a unit-normalized `Vec<f32>`.
///
/// The HTTP skeleton (reqwest client, JSON body, Bearer auth header) is
/// grounded on the teacher's `client.rs::Client::chat` — simplified here
/// since embeddings are a single request/response, not an SSE stream.
use crate::config::{Config, VectorProvider};
use crate::error::{ContextFsError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

pub async fn embed_batch(cfg: &Config, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    match cfg.vector_provider {
        VectorProvider::None => Err(ContextFsError::Provider(
            "vector provider is disabled".to_string(),
        )),
        VectorProvider::Fake => Ok(texts.iter().map(|t| fake_embed(t, cfg.vector_dim)).collect()),
        VectorProvider::Custom | VectorProvider::Siliconflow => {
            http_embed(cfg, texts).await
        }
    }
}

/// Deterministic, dependency-free embedding used for tests and for offline
/// operation: hashes the text into `dim` floats, then unit-normalizes. Not
/// semantically meaningful, but stable and reproducible across runs.
fn fake_embed(text: &str, dim: usize) -> Vec<f32> {
    let mut v = vec![0f32; dim];
    let mut counter: u32 = 0;
    let mut cursor = 0usize;
    while cursor < dim {
        let mut hasher = Sha256::new();
        hasher.update(text);
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();
        for chunk in digest.chunks(4) {
            if cursor >= dim {
                break;
            }
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            let raw = u32::from_le_bytes(bytes);
            v[cursor] = (raw as f32 / u32::MAX as f32) * 2.0 - 1.0;
            cursor += 1;
        }
        counter += 1;
    }
    normalize(&mut v);
    v
}

async fn http_embed(cfg: &Config, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let base_url = cfg
        .embedding_base_url
        .as_deref()
        .ok_or_else(|| ContextFsError::Provider("embeddingBaseUrl not set".to_string()))?;
    let client = reqwest::Client::new();
    let mut out = Vec::with_capacity(texts.len());

    for batch in texts.chunks(cfg.embedding_batch_size.max(1)) {
        let body = EmbeddingRequest {
            model: &cfg.embedding_model,
            input: batch,
        };

        let mut attempt = 0u32;
        loop {
            let mut req = client
                .post(base_url)
                .json(&body)
                .timeout(std::time::Duration::from_millis(cfg.embedding_timeout_ms));
            if let Some(key) = &cfg.embedding_api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let parsed: EmbeddingResponse = resp
                        .json()
                        .await
                        .map_err(|e| ContextFsError::Provider(format!("bad response: {e}")))?;
                    for mut d in parsed.data {
                        normalize(&mut d.embedding);
                        out.push(d.embedding);
                    }
                    break;
                }
                Ok(resp) if attempt < cfg.embedding_max_retries && resp.status().is_server_error() => {
                    attempt += 1;
                    continue;
                }
                Ok(resp) => {
                    return Err(ContextFsError::Provider(format!(
                        "embedding request failed: {}",
                        resp.status()
                    )));
                }
                Err(e) if attempt < cfg.embedding_max_retries && e.is_timeout() => {
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(ContextFsError::Provider(e.to_string())),
            }
        }
    }

    Ok(out)
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_embed_is_deterministic_and_unit_norm() {
        let a = fake_embed("hello world", 16);
        let b = fake_embed("hello world", 16);
        assert_eq!(a, b);
        let norm = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn fake_embed_differs_by_text() {
        let a = fake_embed("hello", 16);
        let b = fake_embed("goodbye", 16);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn none_provider_errors() {
        let cfg = Config::default();
        let err = embed_batch(&cfg, &["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, ContextFsError::Provider(_)));
    }

    #[tokio::test]
    async fn fake_provider_embeds_batch() {
        let mut cfg = Config::default();
        cfg.vector_provider = VectorProvider::Fake;
        cfg.vector_dim = 8;
        let out = embed_batch(&cfg, &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 8);
    }
}
