//! In-memory provisioner used by unit tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use axum::http::StatusCode;
use provisioner_sdk::{CreateVmRequest, CreatedVm, Provisioner, ProvisionerError, VmStatus};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(CreateVmRequest),
    Get(String, String),
    Terminate(String, String),
    Delete(String),
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    live: HashMap<String, String>,
    calls: Vec<Call>,
    fail_create: Option<(StatusCode, String)>,
    fail_terminations: bool,
    missing_api_key: bool,
}

#[derive(Default)]
pub struct FakeProvisioner {
    state: Mutex<FakeState>,
}

impl FakeProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn without_api_key() -> Arc<Self> {
        let fake = Self::default();
        fake.state.lock().unwrap().missing_api_key = true;
        Arc::new(fake)
    }

    pub fn fail_next_create(&self, status: StatusCode, message: &str) {
        self.state.lock().unwrap().fail_create = Some((status, message.to_string()));
    }

    pub fn fail_terminations(&self, fail: bool) {
        self.state.lock().unwrap().fail_terminations = fail;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn live_sessions(&self) -> Vec<String> {
        self.state.lock().unwrap().live.keys().cloned().collect()
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, FakeState>, ProvisionerError> {
        let state = self.state.lock().unwrap();
        if state.missing_api_key {
            return Err(ProvisionerError::MissingApiKey);
        }
        Ok(state)
    }
}

fn not_found() -> ProvisionerError {
    ProvisionerError::Upstream {
        status: StatusCode::NOT_FOUND,
        message: "Session not found".to_string(),
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn create_vm(&self, request: &CreateVmRequest) -> Result<CreatedVm, ProvisionerError> {
        let mut state = self.guard()?;
        state.calls.push(Call::Create(request.clone()));
        if let Some((status, message)) = state.fail_create.take() {
            return Err(ProvisionerError::Upstream { status, message });
        }
        state.next_id += 1;
        let session_id = format!("s{}", state.next_id);
        let admin_token = format!("admin-{session_id}");
        state.live.insert(session_id.clone(), admin_token.clone());
        Ok(CreatedVm {
            url: format!("https://embed.test/{session_id}"),
            session_id,
            admin_token,
        })
    }

    async fn get_vm(
        &self,
        session_id: &str,
        admin_token: &str,
    ) -> Result<VmStatus, ProvisionerError> {
        let mut state = self.guard()?;
        state
            .calls
            .push(Call::Get(session_id.to_string(), admin_token.to_string()));
        match state.live.get(session_id) {
            Some(token) if token == admin_token => Ok(VmStatus {
                status: json!("running"),
                expires_at: json!("2030-01-01T00:00:00Z"),
            }),
            _ => Err(not_found()),
        }
    }

    async fn terminate_vm(
        &self,
        session_id: &str,
        admin_token: &str,
    ) -> Result<(), ProvisionerError> {
        let mut state = self.guard()?;
        state.calls.push(Call::Terminate(
            session_id.to_string(),
            admin_token.to_string(),
        ));
        if state.fail_terminations {
            return Err(ProvisionerError::Upstream {
                status: StatusCode::BAD_GATEWAY,
                message: "terminate failed".to_string(),
            });
        }
        match state.live.get(session_id) {
            Some(token) if token == admin_token => {
                state.live.remove(session_id);
                Ok(())
            }
            _ => Err(not_found()),
        }
    }

    async fn delete_vm(&self, session_id: &str) -> Result<(), ProvisionerError> {
        let mut state = self.guard()?;
        state.calls.push(Call::Delete(session_id.to_string()));
        state.live.remove(session_id).map(|_| ()).ok_or_else(not_found)
    }
}
