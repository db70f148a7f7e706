//! Chat-endpoint client.
//!
//! The call flow is one fixed template: build body, build URL, authorize,
//! send, status-check, parse text + usage, report usage. Provider families
//! only override the hook points on [`ChatProtocol`].

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{record_usage, ChatCallRequest, ModelClient, RetryPolicy, TokenUsage};

const DEFAULT_TEMPERATURE: f64 = 0.4;
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub trait ChatProtocol: Send + Sync {
    fn default_base_url(&self) -> &'static str;

    /// Path appended to the base URL (unless the base carries a `#` override).
    fn endpoint_path(&self) -> &'static str {
        "/chat/completions"
    }

    fn authorize(
        &self,
        req: reqwest::RequestBuilder,
        api_key: &str,
    ) -> reqwest::RequestBuilder {
        req.header(reqwest::header::AUTHORIZATION, format!("Bearer {api_key}"))
    }

    fn build_body(&self, model: &str, call: &ChatCallRequest) -> serde_json::Value;

    fn parse_response(&self, body: &str) -> Result<(String, TokenUsage)>;
}

/// OpenAI-compatible chat schema; the default for most provider families
/// (openai, deepseek, qwen, kimi, grok, openrouter, ...).
pub struct OpenAiProtocol;

impl ChatProtocol for OpenAiProtocol {
    fn default_base_url(&self) -> &'static str {
        "https://api.openai.com/v1"
    }

    fn build_body(&self, model: &str, call: &ChatCallRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": model,
            "messages": [
                {"role": "system", "content": call.system},
                {"role": "user", "content": call.user},
            ],
            "temperature": call.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            "max_tokens": call.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if let Some(stop) = &call.stop {
            body["stop"] = serde_json::json!(stop);
        }
        body
    }

    fn parse_response(&self, body: &str) -> Result<(String, TokenUsage)> {
        let value: serde_json::Value =
            serde_json::from_str(body).context("parse chat completion json")?;
        let content = value
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("chat completion has no message content"))?
            .to_string();
        let usage = TokenUsage {
            prompt_tokens: value
                .pointer("/usage/prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            completion_tokens: value
                .pointer("/usage/completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            total_tokens: value
                .pointer("/usage/total_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        };
        Ok((content, usage))
    }
}

/// Claude-family schema: top-level `system`, typed content blocks, and
/// `x-api-key` + version headers instead of a Bearer token.
pub struct ClaudeProtocol;

impl ChatProtocol for ClaudeProtocol {
    fn default_base_url(&self) -> &'static str {
        "https://api.anthropic.com/v1"
    }

    fn endpoint_path(&self) -> &'static str {
        "/messages"
    }

    fn authorize(
        &self,
        req: reqwest::RequestBuilder,
        api_key: &str,
    ) -> reqwest::RequestBuilder {
        req.header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
    }

    fn build_body(&self, model: &str, call: &ChatCallRequest) -> serde_json::Value {
        serde_json::json!({
            "model": model,
            "max_tokens": call.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "system": call.system,
            "messages": [
                {"role": "user", "content": call.user},
            ],
        })
    }

    fn parse_response(&self, body: &str) -> Result<(String, TokenUsage)> {
        let value: serde_json::Value =
            serde_json::from_str(body).context("parse messages json")?;
        let blocks = value
            .get("content")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("messages response has no content blocks"))?;
        let content = blocks
            .iter()
            .find(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .and_then(|b| b.get("text").and_then(|t| t.as_str()))
            .ok_or_else(|| anyhow!("messages response has no text block"))?
            .to_string();
        let usage = TokenUsage {
            prompt_tokens: value
                .pointer("/usage/input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            completion_tokens: value
                .pointer("/usage/output_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            total_tokens: 0,
        }
        .with_total();
        Ok((content, usage))
    }
}

impl TokenUsage {
    fn with_total(mut self) -> Self {
        if self.total_tokens == 0 {
            self.total_tokens = self.prompt_tokens + self.completion_tokens;
        }
        self
    }
}

/// A user-supplied base URL ending in `#` means "use verbatim": strip the
/// marker and do not append the endpoint path.
pub fn resolve_url(base_url: Option<&str>, default_base: &str, path: &str) -> String {
    let base = base_url
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default_base);
    if let Some(verbatim) = base.strip_suffix('#') {
        return verbatim.to_string();
    }
    format!("{}{}", base.trim_end_matches('/'), path)
}

pub struct ChatClient {
    http: reqwest::Client,
    protocol: Box<dyn ChatProtocol>,
    api_key: String,
    base_url: Option<String>,
    model: String,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ChatClient {
    pub fn new(
        http: reqwest::Client,
        protocol: Box<dyn ChatProtocol>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http,
            protocol,
            api_key: api_key.into(),
            base_url: None,
            model: model.into(),
            retry: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Build a client for a provider family tag. Unknown tags get the
    /// OpenAI-compatible schema with no default base, so a base-URL override
    /// is required for them.
    pub fn for_provider(
        http: reqwest::Client,
        provider: &str,
        api_key: &str,
        base_url: Option<&str>,
        model_override: Option<&str>,
    ) -> Self {
        let tag = provider.trim().to_ascii_lowercase();
        let (protocol, default_model): (Box<dyn ChatProtocol>, &str) = match tag.as_str() {
            "claude" | "anthropic" => (Box::new(ClaudeProtocol), "claude-sonnet-4-20250514"),
            "deepseek" => (Box::new(DeepSeekProtocol), "deepseek-chat"),
            "qwen" => (Box::new(QwenProtocol), "qwen-plus"),
            _ => (Box::new(OpenAiProtocol), "gpt-4o"),
        };
        let model = model_override
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(default_model);

        let mut client = Self::new(http, protocol, api_key, model);
        client.base_url = base_url
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        client
    }

    pub fn configure(
        &mut self,
        api_key: &str,
        base_url: Option<&str>,
        model_override: Option<&str>,
    ) {
        self.api_key = api_key.to_string();
        self.base_url = base_url
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        if let Some(model) = model_override.map(str::trim).filter(|s| !s.is_empty()) {
            self.model = model.to_string();
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> String {
        resolve_url(
            self.base_url.as_deref(),
            self.protocol.default_base_url(),
            self.protocol.endpoint_path(),
        )
    }

    async fn attempt(&self, req: &ChatCallRequest) -> Result<String> {
        let body = self.protocol.build_body(&self.model, req);
        let url = self.url();

        let http_req = self
            .http
            .post(&url)
            .timeout(req.timeout.unwrap_or(self.timeout))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        let http_req = self.protocol.authorize(http_req, &self.api_key);

        let resp = http_req.json(&body).send().await.context("model request")?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let snippet: String = text.chars().take(800).collect();
            return Err(anyhow!("model api {}: {}", status.as_u16(), snippet));
        }

        let (content, usage) = self.protocol.parse_response(&text)?;
        record_usage(&self.model, &usage);
        Ok(content)
    }
}

#[async_trait]
impl ModelClient for ChatClient {
    async fn call_request(&self, req: &ChatCallRequest) -> Result<String> {
        let start = Instant::now();
        let mut last_err = anyhow!("no attempts made");

        for attempt in 1..=self.retry.max_attempts {
            match self.attempt(req).await {
                Ok(content) => {
                    debug!(
                        model = %self.model,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "model call ok"
                    );
                    return Ok(content);
                }
                Err(e) => {
                    let transient = self.retry.is_transient(&format!("{e:#}"));
                    if !transient || attempt == self.retry.max_attempts {
                        return Err(e);
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        model = %self.model,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient model error, retrying"
                    );
                    last_err = e;
                    sleep(delay).await;
                }
            }
        }
        Err(last_err)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// DeepSeek: OpenAI schema, different home base.
pub struct DeepSeekProtocol;

impl ChatProtocol for DeepSeekProtocol {
    fn default_base_url(&self) -> &'static str {
        "https://api.deepseek.com"
    }

    fn build_body(&self, model: &str, call: &ChatCallRequest) -> serde_json::Value {
        OpenAiProtocol.build_body(model, call)
    }

    fn parse_response(&self, body: &str) -> Result<(String, TokenUsage)> {
        OpenAiProtocol.parse_response(body)
    }
}

/// Qwen through the OpenAI-compatible gateway.
pub struct QwenProtocol;

impl ChatProtocol for QwenProtocol {
    fn default_base_url(&self) -> &'static str {
        "https://dashscope.aliyuncs.com/compatible-mode/v1"
    }

    fn build_body(&self, model: &str, call: &ChatCallRequest) -> serde_json::Value {
        OpenAiProtocol.build_body(model, call)
    }

    fn parse_response(&self, body: &str) -> Result<(String, TokenUsage)> {
        OpenAiProtocol.parse_response(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_override_with_hash_is_verbatim() {
        let url = resolve_url(
            Some("https://example.com/v1/proxy#"),
            "https://api.openai.com/v1",
            "/chat/completions",
        );
        assert_eq!(url, "https://example.com/v1/proxy");
    }

    #[test]
    fn url_without_hash_appends_path() {
        let url = resolve_url(
            Some("https://example.com/v1/"),
            "https://api.openai.com/v1",
            "/chat/completions",
        );
        assert_eq!(url, "https://example.com/v1/chat/completions");

        let url = resolve_url(None, "https://api.openai.com/v1", "/chat/completions");
        assert_eq!(url, "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn openai_body_shape() {
        let body = OpenAiProtocol.build_body(
            "gpt-4o",
            &ChatCallRequest {
                system: "sys".into(),
                user: "usr".into(),
                max_tokens: Some(128),
                ..Default::default()
            },
        );
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "usr");
        assert_eq!(body["max_tokens"], 128);
    }

    #[test]
    fn claude_body_and_parse() {
        let body = ClaudeProtocol.build_body(
            "claude-sonnet-4-20250514",
            &ChatCallRequest {
                system: "sys".into(),
                user: "usr".into(),
                ..Default::default()
            },
        );
        assert_eq!(body["system"], "sys");
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("temperature").is_none());

        let resp = r#"{
            "content": [
                {"type": "thinking", "thinking": "..."},
                {"type": "text", "text": "hello"}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 3}
        }"#;
        let (text, usage) = ClaudeProtocol.parse_response(resp).unwrap();
        assert_eq!(text, "hello");
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn openai_parse_extracts_usage() {
        let resp = r#"{
            "choices": [{"message": {"role": "assistant", "content": "ok"}}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 20, "total_tokens": 120}
        }"#;
        let (text, usage) = OpenAiProtocol.parse_response(resp).unwrap();
        assert_eq!(text, "ok");
        assert_eq!(usage.completion_tokens, 20);
        assert!(OpenAiProtocol.parse_response("{}").is_err());
    }
}
