use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::debug;

use crate::{CreateVmRequest, CreatedVm, Provisioner, ProvisionerError, VmStatus};

pub const DEFAULT_BASE_URL: &str = "https://engine.hyperbeam.com/v0";
pub const ADMIN_TOKEN_HEADER: &str = "X-Hyperbeam-Admin-Token";

#[derive(Clone)]
pub struct HyperbeamClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateVmResponse {
    session_id: String,
    admin_token: String,
    #[serde(default)]
    embed_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

impl HyperbeamClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn api_key(&self) -> Result<&str, ProvisionerError> {
        self.api_key
            .as_deref()
            .ok_or(ProvisionerError::MissingApiKey)
    }

    fn vm_url(&self, session_id: &str) -> String {
        format!("{}/vm/{}", self.base_url, session_id)
    }
}

#[async_trait]
impl Provisioner for HyperbeamClient {
    async fn create_vm(&self, request: &CreateVmRequest) -> Result<CreatedVm, ProvisionerError> {
        let api_key = self.api_key()?;
        debug!(target_url = %request.url, expires_in = request.expires_in, "creating vm");
        let res = self
            .http
            .post(format!("{}/vm", self.base_url))
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await?;
        let res = ensure_success(res).await?;
        let body: CreateVmResponse = res
            .json()
            .await
            .map_err(|err| ProvisionerError::Malformed(err.to_string()))?;
        let url = body.embed_url.or(body.url).ok_or_else(|| {
            ProvisionerError::Malformed("response missing embed_url".to_string())
        })?;
        Ok(CreatedVm {
            session_id: body.session_id,
            admin_token: body.admin_token,
            url,
        })
    }

    async fn get_vm(
        &self,
        session_id: &str,
        admin_token: &str,
    ) -> Result<VmStatus, ProvisionerError> {
        let api_key = self.api_key()?;
        let res = self
            .http
            .get(self.vm_url(session_id))
            .bearer_auth(api_key)
            .header(ADMIN_TOKEN_HEADER, admin_token)
            .send()
            .await?;
        let res = ensure_success(res).await?;
        res.json()
            .await
            .map_err(|err| ProvisionerError::Malformed(err.to_string()))
    }

    async fn terminate_vm(
        &self,
        session_id: &str,
        admin_token: &str,
    ) -> Result<(), ProvisionerError> {
        let api_key = self.api_key()?;
        let res = self
            .http
            .post(format!("{}/terminate", self.vm_url(session_id)))
            .bearer_auth(api_key)
            .header(ADMIN_TOKEN_HEADER, admin_token)
            .send()
            .await?;
        ensure_success(res).await.map(|_| ())
    }

    async fn delete_vm(&self, session_id: &str) -> Result<(), ProvisionerError> {
        let api_key = self.api_key()?;
        let res = self
            .http
            .delete(self.vm_url(session_id))
            .bearer_auth(api_key)
            .send()
            .await?;
        ensure_success(res).await.map(|_| ())
    }
}

async fn ensure_success(res: Response) -> Result<Response, ProvisionerError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    Err(ProvisionerError::Upstream {
        status,
        message: upstream_message(&body),
    })
}

/// Pull a human readable message out of an upstream error body.
pub(crate) fn upstream_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return "Unknown error".to_string();
    };
    match value.get("error") {
        Some(serde_json::Value::String(msg)) if !msg.is_empty() => return msg.clone(),
        Some(serde_json::Value::Object(obj)) => {
            if let Some(msg) = obj.get("message").and_then(|m| m.as_str()) {
                return msg.to_string();
            }
        }
        _ => {}
    }
    value
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| "Unknown error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn extracts_error_string() {
        assert_eq!(upstream_message(r#"{"error":"quota exceeded"}"#), "quota exceeded");
    }

    #[test_timeout::timeout]
    fn extracts_nested_error_message() {
        assert_eq!(
            upstream_message(r#"{"error":{"message":"bad key","code":401}}"#),
            "bad key"
        );
        assert_eq!(upstream_message(r#"{"message":"not found"}"#), "not found");
    }

    #[test_timeout::timeout]
    fn falls_back_to_unknown_error() {
        assert_eq!(upstream_message("<html>502</html>"), "Unknown error");
        assert_eq!(upstream_message("{}"), "Unknown error");
    }

    #[test_timeout::timeout]
    fn blank_api_key_is_treated_as_missing() {
        let client = HyperbeamClient::new("http://localhost/v0/", Some("  ".into()));
        assert!(!client.has_api_key());
        assert_eq!(client.vm_url("abc"), "http://localhost/v0/vm/abc");
    }

    #[tokio::test]
    async fn missing_key_fails_before_network() {
        // Port 9 is discard; the request must never be attempted.
        let client = HyperbeamClient::new("http://127.0.0.1:9", None);
        let err = client
            .create_vm(&CreateVmRequest {
                url: "https://example.com".into(),
                expires_in: 60,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionerError::MissingApiKey));
    }
}
