use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{LlmError, Result};
use crate::models::{
    build_inner_request, build_messages_request, ApiErrorEnvelope, BatchItem, BatchRequest,
    BatchResultLine, BatchStatusResponse, CreateBatchResponse, MessagesResponse, DEFAULT_MAX_TOKENS,
    DEFAULT_MODEL,
};

const API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const BATCHES_BETA: &str = "message-batches-2024-09-24";

// soft deadline applied to every single call on top of caller timeouts
const SINGLE_CALL_TIMEOUT: Duration = Duration::from_secs(20);

/// One synchronous call: one prompt in, one answer out.
#[async_trait]
pub trait SingleCall: Send + Sync {
    async fn run(&self, text: &str, prompt: &str) -> Result<String>;
}

/// Submit a labeled batch and poll it to completion.
#[async_trait]
pub trait BatchCall: Send + Sync {
    async fn run_message_batch(
        &self,
        items: Vec<BatchItem>,
        poll_every: Duration,
        poll_timeout: Duration,
    ) -> Result<HashMap<String, String>>;
}

fn auth_headers(key: &str, beta: Option<&str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let mut api_key = HeaderValue::from_str(key).map_err(LlmError::config)?;
    api_key.set_sensitive(true);
    headers.insert("x-api-key", api_key);
    headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
    if let Some(beta) = beta {
        headers.insert(
            "anthropic-beta",
            HeaderValue::from_str(beta).map_err(LlmError::config)?,
        );
    }
    Ok(headers)
}

fn api_key_from_env() -> Result<String> {
    let key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
    if key.is_empty() {
        return Err(LlmError::Config {
            message: "ANTHROPIC_API_KEY is not set".to_string(),
        });
    }
    Ok(key)
}

fn request_err(location: &'static str, e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Deadline {
            message: format!("{location}: {e}"),
        }
    } else {
        LlmError::upstream(location, e)
    }
}

// turn a non-2xx response into a tagged upstream error
async fn error_from_response(location: &'static str, resp: reqwest::Response) -> LlmError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ApiErrorEnvelope>(&body) {
        Ok(env) => format!("type={} message={}", env.error.kind, env.error.message),
        Err(_) => body,
    };
    LlmError::Upstream {
        location,
        message: format!("http {status}: {message}"),
    }
}

pub struct AnthropicSingleClient {
    http: reqwest::Client,
    model: String,
    max_tokens: u32,
}

impl AnthropicSingleClient {
    pub fn from_env() -> Result<Self> {
        let key = api_key_from_env()?;
        let http = reqwest::Client::builder()
            .timeout(SINGLE_CALL_TIMEOUT)
            .default_headers(auth_headers(&key, None)?)
            .build()
            .map_err(LlmError::config)?;

        Ok(Self {
            http,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        })
    }
}

#[async_trait]
impl SingleCall for AnthropicSingleClient {
    async fn run(&self, text: &str, prompt: &str) -> Result<String> {
        let req = build_messages_request(text, prompt, &self.model, self.max_tokens);

        let resp = self
            .http
            .post(format!("{API_BASE}/v1/messages"))
            .json(&req)
            .send()
            .await
            .map_err(|e| request_err("create_messages", e))?;
        if !resp.status().is_success() {
            return Err(error_from_response("create_messages", resp).await);
        }

        let body: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| request_err("create_messages", e))?;
        Ok(body.joined_text())
    }
}

pub struct AnthropicBatchClient {
    http: reqwest::Client,
    model: String,
    max_tokens: u32,
}

impl AnthropicBatchClient {
    pub fn from_env() -> Result<Self> {
        let key = api_key_from_env()?;
        let http = reqwest::Client::builder()
            .default_headers(auth_headers(&key, Some(BATCHES_BETA))?)
            .build()
            .map_err(LlmError::config)?;

        Ok(Self {
            http,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        })
    }

    async fn retrieve_status(&self, batch_id: &str) -> Result<BatchStatusResponse> {
        let resp = self
            .http
            .get(format!("{API_BASE}/v1/messages/batches/{batch_id}"))
            .send()
            .await
            .map_err(|e| request_err("retrieve_batch", e))?;
        if !resp.status().is_success() {
            return Err(error_from_response("retrieve_batch", resp).await);
        }
        resp.json().await.map_err(|e| request_err("retrieve_batch", e))
    }
}

#[async_trait]
impl BatchCall for AnthropicBatchClient {
    async fn run_message_batch(
        &self,
        items: Vec<BatchItem>,
        poll_every: Duration,
        poll_timeout: Duration,
    ) -> Result<HashMap<String, String>> {
        if items.is_empty() {
            return Ok(HashMap::new());
        }

        let reqs: Vec<_> = items
            .iter()
            .map(|item| build_inner_request(item, &self.model, self.max_tokens))
            .collect();

        let resp = self
            .http
            .post(format!("{API_BASE}/v1/messages/batches"))
            .json(&BatchRequest { requests: reqs })
            .send()
            .await
            .map_err(|e| request_err("create_batch", e))?;
        if !resp.status().is_success() {
            return Err(error_from_response("create_batch", resp).await);
        }
        let created: CreateBatchResponse = resp
            .json()
            .await
            .map_err(|e| request_err("create_batch", e))?;
        let batch_id = created.id;
        debug!(%batch_id, items = items.len(), "submitted message batch");

        // poll until the batch settles or the timeout budget runs out
        let deadline = Instant::now() + poll_timeout;
        loop {
            tokio::time::sleep(poll_every).await;
            if Instant::now() >= deadline {
                warn!(%batch_id, "message batch poll timed out");
                return Err(LlmError::Deadline {
                    message: format!("batch {batch_id} timed out after {poll_timeout:?}"),
                });
            }

            let status = self.retrieve_status(&batch_id).await?;
            match status.processing_status.as_str() {
                "ended" | "completed" | "finished" => break,
                "failed" | "canceled" => {
                    return Err(LlmError::Upstream {
                        location: "retrieve_batch",
                        message: format!(
                            "batch {batch_id} ended with status={}",
                            status.processing_status
                        ),
                    });
                }
                _ => {}
            }
        }

        let resp = self
            .http
            .get(format!("{API_BASE}/v1/messages/batches/{batch_id}/results"))
            .send()
            .await
            .map_err(|e| request_err("retrieve_batch_results", e))?;
        if !resp.status().is_success() {
            return Err(error_from_response("retrieve_batch_results", resp).await);
        }
        let body = resp
            .text()
            .await
            .map_err(|e| request_err("retrieve_batch_results", e))?;

        Ok(parse_batch_results(&body))
    }
}

/// Parses the JSONL results stream; non-`succeeded` sub-results map to "".
pub fn parse_batch_results(body: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: BatchResultLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(%e, "skipping malformed batch result line");
                continue;
            }
        };
        let answer = if parsed.result.kind == "succeeded" {
            parsed
                .result
                .message
                .map(|m| m.joined_text())
                .unwrap_or_default()
        } else {
            String::new()
        };
        out.insert(parsed.custom_id, answer);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_a_config_error() {
        // only run when the environment has no key, to avoid clobbering it
        if std::env::var("ANTHROPIC_API_KEY").is_ok() {
            return;
        }
        assert!(matches!(
            AnthropicSingleClient::from_env(),
            Err(LlmError::Config { .. })
        ));
        assert!(matches!(
            AnthropicBatchClient::from_env(),
            Err(LlmError::Config { .. })
        ));
    }

    #[test]
    fn parse_batch_results_mixed_outcomes() {
        let body = concat!(
            r#"{"custom_id":"a","result":{"type":"succeeded","message":{"content":[{"type":"text","text":"cats"}]}}}"#,
            "\n",
            r#"{"custom_id":"b","result":{"type":"errored"}}"#,
            "\n\n",
            r#"{"custom_id":"c","result":{"type":"succeeded","message":{"content":[{"type":"text","text":"one "},{"type":"text","text":"two"}]}}}"#,
            "\n",
        );
        let out = parse_batch_results(body);
        assert_eq!(out.len(), 3);
        assert_eq!(out["a"], "cats");
        assert_eq!(out["b"], "");
        assert_eq!(out["c"], "one two");
    }

    #[test]
    fn parse_batch_results_skips_garbage_lines() {
        let body = "not json\n{\"custom_id\":\"a\",\"result\":{\"type\":\"succeeded\",\"message\":{\"content\":[]}}}";
        let out = parse_batch_results(body);
        assert_eq!(out.len(), 1);
        assert_eq!(out["a"], "");
    }
}
