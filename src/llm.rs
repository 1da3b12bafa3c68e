use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::header::USER_AGENT;
use serde_json::{Value, json};

use crate::http_client::{USER_AGENT_VALUE, http_client, read_success_body};

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(8);
const SYSTEM_PROMPT: &str =
    "You write short, cautious shopping advice about video game prices. Never promise outcomes.";

pub trait TextGenerator: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String>;
}

/// OpenAI-compatible chat completions client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: Option<String>, base_url: &str, model: &str) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

impl TextGenerator for OpenAiClient {
    fn is_enabled(&self) -> bool {
        self.api_key.is_some() && !self.model.is_empty()
    }

    fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("text generator is not configured"))?;
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": max_tokens,
            "temperature": 0.3,
        });
        let resp = http_client()?
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header(USER_AGENT, USER_AGENT_VALUE)
            .bearer_auth(key)
            .json(&body)
            .timeout(COMPLETION_TIMEOUT)
            .send()
            .context("chat completion request failed")?;
        let raw = read_success_body(resp).context("chat completion")?;
        parse_chat_completion_json(&raw)
    }
}

/// Content of the first choice's message.
pub fn parse_chat_completion_json(raw: &str) -> Result<String> {
    let value = serde_json::from_str::<Value>(raw).context("invalid chat completion json")?;
    let content = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("chat completion has no message content"))?;
    let content = content.trim();
    if content.is_empty() {
        return Err(anyhow!("chat completion content is empty"));
    }
    Ok(content.to_string())
}
