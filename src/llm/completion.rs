//! Legacy "app completion" client: session-scoped multi-turn calls against a
//! vendor app endpoint, with server-assigned session ids and optional SSE
//! streaming. Only used when a model config points at an app id; everything
//! else goes through the chat client.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{record_usage, ChatCallRequest, ModelClient, TokenUsage};

const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/api/v1";

#[derive(Debug, Serialize)]
struct CompletionInput<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    biz_params: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct CompletionParameters<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    incremental_output: Option<bool>,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    input: CompletionInput<'a>,
    parameters: CompletionParameters<'a>,
}

#[derive(Debug, Deserialize)]
struct CompletionOutput {
    #[serde(default)]
    text: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    output: Option<CompletionOutput>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    request_id: Option<String>,
}

pub struct CompletionClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    app_id: String,
    streaming: bool,
    timeout: Duration,
    /// Server-assigned after the first turn; carried to keep the session.
    session_id: Mutex<Option<String>>,
}

impl CompletionClient {
    pub fn new(
        http: reqwest::Client,
        api_key: impl Into<String>,
        app_id: impl Into<String>,
        base_url: Option<&str>,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            app_id: app_id.into(),
            streaming: false,
            timeout: Duration::from_secs(60),
            session_id: Mutex::new(None),
        }
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn reset_session(&self) {
        *self.session_id.lock() = None;
    }

    fn url(&self) -> String {
        format!("{}/apps/{}/completion", self.base_url, self.app_id)
    }
}

#[async_trait]
impl ModelClient for CompletionClient {
    async fn call_request(&self, req: &ChatCallRequest) -> Result<String> {
        // The app endpoint has no separate system slot; prepend it.
        let prompt = if req.system.is_empty() {
            req.user.clone()
        } else {
            format!("{}\n\n{}", req.system, req.user)
        };

        let session = self.session_id.lock().clone();
        let body = CompletionRequest {
            input: CompletionInput {
                prompt: &prompt,
                biz_params: None,
            },
            parameters: CompletionParameters {
                session_id: session.as_deref(),
                incremental_output: self.streaming.then_some(true),
            },
        };

        let mut http_req = self
            .http
            .post(self.url())
            .timeout(req.timeout.unwrap_or(self.timeout))
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if self.streaming {
            http_req = http_req.header("X-DashScope-SSE", "enable");
        }

        let resp = http_req
            .json(&body)
            .send()
            .await
            .context("app completion request")?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = text.chars().take(800).collect();
            return Err(anyhow!("app completion {}: {}", status.as_u16(), snippet));
        }

        let parsed: CompletionResponse =
            serde_json::from_str(&text).context("parse app completion json")?;
        if let Some(code) = parsed.code.filter(|c| !c.is_empty()) {
            return Err(anyhow!(
                "app completion error {code}: {}",
                parsed.message.unwrap_or_default()
            ));
        }
        let output = parsed
            .output
            .ok_or_else(|| anyhow!("app completion has no output"))?;

        if let Some(session_id) = output.session_id {
            *self.session_id.lock() = Some(session_id);
        }
        if let Some(usage) = parsed.usage {
            record_usage(
                &self.app_id,
                &TokenUsage {
                    prompt_tokens: usage.input_tokens,
                    completion_tokens: usage.output_tokens,
                    total_tokens: usage.input_tokens + usage.output_tokens,
                },
            );
        }
        Ok(output.text)
    }

    fn model_name(&self) -> &str {
        &self.app_id
    }
}
