//! Model-endpoint clients.
//!
//! Every provider family sits behind [`ModelClient`]; the chat client in
//! `chat.rs` drives a fixed call template with per-provider hooks, the
//! completion client in `completion.rs` speaks the legacy session-scoped app
//! endpoint.

pub mod chat;
pub mod completion;
pub mod retry;

pub use chat::{ChatClient, ClaudeProtocol, OpenAiProtocol};
pub use completion::CompletionClient;
pub use retry::RetryPolicy;

use anyhow::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A single chat call. `system`/`user` are mandatory; the rest override the
/// client's defaults.
#[derive(Debug, Clone, Default)]
pub struct ChatCallRequest {
    pub system: String,
    pub user: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
    pub timeout: Option<Duration>,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Plain system+user call with client defaults.
    async fn call(&self, system: &str, user: &str) -> Result<String> {
        self.call_request(&ChatCallRequest {
            system: system.to_string(),
            user: user.to_string(),
            ..Default::default()
        })
        .await
    }

    async fn call_request(&self, req: &ChatCallRequest) -> Result<String>;

    /// Provider-visible model name, for logs and usage accounting.
    fn model_name(&self) -> &str;
}

/// Credential columns hold base64-wrapped ciphertext; the cipher itself
/// lives outside this service. Unwrap the base64 layer, falling back to the
/// raw value for rows written before wrapping existed.
pub fn reveal_key(stored: &str) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    match STANDARD.decode(stored.trim()) {
        Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| stored.to_string()),
        Err(_) => stored.to_string(),
    }
}

type UsageHook = Arc<dyn Fn(&str, &TokenUsage) + Send + Sync>;

#[derive(Default)]
struct UsageBook {
    totals: HashMap<String, TokenUsage>,
    hook: Option<UsageHook>,
}

lazy_static! {
    static ref USAGE: RwLock<UsageBook> = RwLock::new(UsageBook::default());
}

/// Install the process-global usage hook. Set once at startup; the hook must
/// not block.
pub fn set_usage_hook(hook: impl Fn(&str, &TokenUsage) + Send + Sync + 'static) {
    USAGE.write().hook = Some(Arc::new(hook));
}

/// Record one call's token usage. Short lock hold, then the optional hook
/// runs outside the lock.
pub fn record_usage(model: &str, usage: &TokenUsage) {
    let hook = {
        let mut book = USAGE.write();
        let entry = book.totals.entry(model.to_string()).or_default();
        entry.prompt_tokens += usage.prompt_tokens;
        entry.completion_tokens += usage.completion_tokens;
        entry.total_tokens += usage.total_tokens;
        book.hook.clone()
    };
    if let Some(hook) = hook {
        hook(model, usage);
    }
}

/// Accumulated per-model totals since startup.
pub fn usage_totals() -> HashMap<String, TokenUsage> {
    USAGE.read().totals.clone()
}
