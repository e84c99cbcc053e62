use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{config::OpenRouterConfig, error::BrokerError};

pub const FALLBACK_REPLY: &str = "Sorry, I couldn't understand.";
const CHAT_API_ERROR: &str = "OpenRouter API error";

/// One turn of the conversation as the client sends it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

/// Single-shot pass-through to an OpenAI-compatible chat completion API.
#[derive(Clone)]
pub struct ChatProxy {
    http: Client,
    config: OpenRouterConfig,
}

impl ChatProxy {
    pub fn new(config: OpenRouterConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    /// Returns the first completion's text, or [`FALLBACK_REPLY`] when upstream
    /// answers without one.
    pub async fn complete(&self, history: &[ChatTurn]) -> Result<String, BrokerError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| BrokerError::Configuration("API key not set".to_string()))?;

        let messages = history
            .iter()
            .map(|turn| ChatMessage {
                role: if turn.role == "user" { "user" } else { "assistant" },
                content: &turn.text,
            })
            .collect();
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        debug!(model = %self.config.chat_model, turns = history.len(), "requesting chat completion");

        let res = self
            .http
            .post(url)
            .bearer_auth(api_key)
            .json(&CompletionRequest {
                model: &self.config.chat_model,
                messages,
            })
            .send()
            .await
            .map_err(|err| {
                warn!(error = %err, "chat api unreachable");
                chat_api_error(None)
            })?;

        let status = res.status();
        if !status.is_success() {
            warn!(%status, "chat api returned an error");
            return Err(chat_api_error(Some(status)));
        }
        let body: Value = res.json().await.map_err(|err| {
            warn!(error = %err, "chat api returned a malformed body");
            chat_api_error(None)
        })?;

        Ok(body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .unwrap_or(FALLBACK_REPLY)
            .to_string())
    }
}

fn chat_api_error(status: Option<reqwest::StatusCode>) -> BrokerError {
    BrokerError::Upstream {
        status,
        message: CHAT_API_ERROR.to_string(),
    }
}
