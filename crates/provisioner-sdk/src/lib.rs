//! Client for remote-browser provisioning APIs.
//!
//! The broker only talks to upstream through the [`Provisioner`] trait so the
//! session lifecycle can be exercised against in-memory fakes. [`HyperbeamClient`]
//! is the HTTP implementation used in production.

mod client;

pub use client::{HyperbeamClient, ADMIN_TOKEN_HEADER, DEFAULT_BASE_URL};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Body sent to `POST /vm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateVmRequest {
    pub url: String,
    pub expires_in: u64,
}

/// Session material returned by upstream on creation. `admin_token` must stay
/// on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedVm {
    pub session_id: String,
    pub admin_token: String,
    pub url: String,
}

/// Transient status fields, passed through to clients verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmStatus {
    #[serde(default)]
    pub status: serde_json::Value,
    #[serde(default)]
    pub expires_at: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum ProvisionerError {
    #[error("provisioning api key not configured")]
    MissingApiKey,
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned {status}: {message}")]
    Upstream {
        status: reqwest::StatusCode,
        message: String,
    },
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// `POST /vm`, authenticated with the API key.
    async fn create_vm(&self, request: &CreateVmRequest) -> Result<CreatedVm, ProvisionerError>;

    /// `GET /vm/{id}`, authenticated with the API key and admin token.
    async fn get_vm(&self, session_id: &str, admin_token: &str)
        -> Result<VmStatus, ProvisionerError>;

    /// Soft termination: `POST /vm/{id}/terminate` with the admin token.
    async fn terminate_vm(&self, session_id: &str, admin_token: &str)
        -> Result<(), ProvisionerError>;

    /// Hard delete: `DELETE /vm/{id}` with the API key only.
    async fn delete_vm(&self, session_id: &str) -> Result<(), ProvisionerError>;
}
