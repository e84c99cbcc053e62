use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{config::OpenRouterConfig, error::BrokerError};

const IMAGE_SIZE: &str = "1024x1024";

/// Single-shot pass-through to an OpenAI-compatible image generation API.
#[derive(Clone)]
pub struct ImageProxy {
    http: Client,
    config: OpenRouterConfig,
}

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    prompt: &'a str,
    model: &'a str,
    n: u32,
    size: &'a str,
}

impl ImageProxy {
    pub fn new(config: OpenRouterConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    /// Returns the URL of the first generated image.
    pub async fn generate(&self, prompt: &str) -> Result<String, BrokerError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| BrokerError::Configuration("API key not set".to_string()))?;

        let url = format!(
            "{}/images/generations",
            self.config.base_url.trim_end_matches('/')
        );
        debug!(model = %self.config.image_model, "requesting image generation");
        let res = self
            .http
            .post(url)
            .bearer_auth(api_key)
            .json(&GenerationRequest {
                prompt,
                model: &self.config.image_model,
                n: 1,
                size: IMAGE_SIZE,
            })
            .send()
            .await
            .map_err(|err| {
                warn!(error = %err, "image api unreachable");
                image_api_error("Image API error")
            })?;

        let status = res.status();
        let body: Value = res.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = error_message(&body);
            warn!(%status, %message, "image api returned an error");
            return Err(BrokerError::Upstream {
                status: Some(status),
                message,
            });
        }

        body.pointer("/data/0/url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| image_api_error("No image URL returned from API"))
    }
}

fn image_api_error(message: &str) -> BrokerError {
    BrokerError::Upstream {
        status: None,
        message: message.to_string(),
    }
}

fn error_message(body: &Value) -> String {
    match body.get("error") {
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        Some(Value::String(msg)) if !msg.is_empty() => msg.clone(),
        _ => "Image API error".to_string(),
    }
}
