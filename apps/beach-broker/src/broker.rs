use std::{sync::Arc, time::Duration};

use metrics::counter;
use provisioner_sdk::{CreateVmRequest, Provisioner, VmStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::BrokerError,
    expiry::ExpiryScheduler,
    store::{CredentialStore, SessionRecord},
};

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub default_url: String,
    pub default_ttl: Duration,
    pub max_ttl: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            default_url: "https://youtube.com".to_string(),
            default_ttl: Duration::from_secs(300),
            max_ttl: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// What the client gets back. The admin token is deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSession {
    pub url: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminateMode {
    /// `POST /vm/{id}/terminate` with the stored admin token.
    #[default]
    Soft,
    /// `DELETE /vm/{id}` with the API key only.
    Hard,
}

impl TerminateMode {
    fn label(self) -> &'static str {
        match self {
            TerminateMode::Soft => "soft",
            TerminateMode::Hard => "hard",
        }
    }
}

/// Creates, inspects and tears down upstream sessions on behalf of clients that
/// only ever hold a session id.
#[derive(Clone)]
pub struct SessionBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    store: Arc<CredentialStore>,
    provisioner: Arc<dyn Provisioner>,
    expiry: ExpiryScheduler,
    options: BrokerOptions,
}

impl SessionBroker {
    pub fn new(
        store: Arc<CredentialStore>,
        provisioner: Arc<dyn Provisioner>,
        options: BrokerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                store,
                provisioner,
                expiry: ExpiryScheduler::new(),
                options,
            }),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn expiry(&self) -> &ExpiryScheduler {
        &self.inner.expiry
    }

    pub async fn create(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, BrokerError> {
        let url = self.resolve_url(request.url)?;
        let ttl = self.resolve_ttl(request.expires_in)?;

        let created = self
            .inner
            .provisioner
            .create_vm(&CreateVmRequest {
                url,
                expires_in: ttl.as_secs(),
            })
            .await
            .map_err(|err| upstream_failure("create", err.into()))?;

        let session_id = created.session_id;
        let previous = self
            .inner
            .store
            .put(session_id.clone(), SessionRecord::new(created.admin_token, ttl));
        if previous.is_some() {
            warn!(session_id = %session_id, "upstream reused a session id; replacing stored credential");
        }

        let broker = self.clone();
        let expiring_id = session_id.clone();
        self.inner.expiry.schedule(&session_id, ttl, async move {
            broker.expire(&expiring_id).await;
        });

        counter!("beach_broker_sessions_created_total").increment(1);
        info!(session_id = %session_id, ttl_secs = ttl.as_secs(), "session created");

        Ok(CreatedSession {
            url: created.url,
            session_id,
        })
    }

    pub async fn status(&self, session_id: &str) -> Result<VmStatus, BrokerError> {
        let admin_token = self.admin_token(session_id)?;
        self.inner
            .provisioner
            .get_vm(session_id, &admin_token)
            .await
            .map_err(|err| upstream_failure("status", err.into()))
    }

    pub async fn terminate(&self, session_id: &str, mode: TerminateMode) -> Result<(), BrokerError> {
        let admin_token = self.admin_token(session_id)?;
        let result = match mode {
            TerminateMode::Soft => {
                self.inner
                    .provisioner
                    .terminate_vm(session_id, &admin_token)
                    .await
            }
            TerminateMode::Hard => self.inner.provisioner.delete_vm(session_id).await,
        };
        result.map_err(|err| upstream_failure("terminate", err.into()))?;

        let removed = self.inner.store.remove(session_id);
        self.inner.expiry.cancel(session_id);
        counter!(
            "beach_broker_sessions_terminated_total",
            "mode" => mode.label(),
            "origin" => "client"
        )
        .increment(1);
        let lived_secs = removed
            .map(|record| (OffsetDateTime::now_utc() - record.created_at).whole_seconds())
            .unwrap_or_default();
        info!(session_id = %session_id, mode = mode.label(), lived_secs, "session terminated");
        Ok(())
    }

    /// Scheduled termination. Never reports failure to anyone: the TTL was also
    /// sent upstream, so the local record is dropped even if the call fails.
    async fn expire(&self, session_id: &str) {
        let Some(record) = self.inner.store.record(session_id) else {
            debug!(session_id = %session_id, "session already gone at expiry");
            return;
        };
        match self
            .inner
            .provisioner
            .terminate_vm(session_id, &record.admin_token)
            .await
        {
            Ok(()) => info!(
                session_id = %session_id,
                created_at = %record.created_at,
                expires_at = %record.expires_at,
                "session expired"
            ),
            Err(err) => warn!(
                session_id = %session_id,
                expires_at = %record.expires_at,
                error = %err,
                "scheduled termination failed; dropping local record"
            ),
        }
        self.inner.store.remove(session_id);
        counter!(
            "beach_broker_sessions_terminated_total",
            "mode" => TerminateMode::Soft.label(),
            "origin" => "expiry"
        )
        .increment(1);
    }

    fn admin_token(&self, session_id: &str) -> Result<String, BrokerError> {
        if session_id.trim().is_empty() {
            return Err(BrokerError::Validation("Missing session_id".to_string()));
        }
        self.inner
            .store
            .get(session_id)
            .ok_or(BrokerError::UnknownSession)
    }

    fn resolve_url(&self, requested: Option<String>) -> Result<String, BrokerError> {
        let raw = match requested {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => return Ok(self.inner.options.default_url.clone()),
        };
        match Url::parse(&raw) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(raw),
            _ => Err(BrokerError::Validation(
                "url must be an absolute http(s) URL".to_string(),
            )),
        }
    }

    fn resolve_ttl(&self, requested: Option<u64>) -> Result<Duration, BrokerError> {
        let Some(secs) = requested else {
            return Ok(self.inner.options.default_ttl);
        };
        let max = self.inner.options.max_ttl.as_secs();
        if secs == 0 || secs > max {
            return Err(BrokerError::Validation(format!(
                "expires_in must be between 1 and {max} seconds"
            )));
        }
        Ok(Duration::from_secs(secs))
    }
}

fn upstream_failure(op: &'static str, err: BrokerError) -> BrokerError {
    if matches!(err, BrokerError::Upstream { .. } | BrokerError::Transport(_)) {
        counter!(
            "beach_broker_upstream_failures_total",
            "op" => op,
            "reason" => err.metric_label()
        )
        .increment(1);
        warn!(op, error = %err, "upstream call failed");
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeProvisioner};
    use axum::http::StatusCode;

    fn broker_with(fake: &Arc<FakeProvisioner>) -> SessionBroker {
        SessionBroker::new(
            Arc::new(CredentialStore::new()),
            fake.clone(),
            BrokerOptions::default(),
        )
    }

    #[tokio::test]
    async fn create_stores_credential_and_hides_it() {
        let fake = FakeProvisioner::new();
        let broker = broker_with(&fake);

        let created = broker
            .create(CreateSessionRequest::default())
            .await
            .expect("create");
        assert_eq!(created.session_id, "s1");
        assert_eq!(broker.store().get("s1").as_deref(), Some("admin-s1"));

        let body = serde_json::to_value(&created).unwrap();
        assert!(body.get("admin_token").is_none());
        assert_eq!(
            fake.calls()[0],
            Call::Create(CreateVmRequest {
                url: "https://youtube.com".into(),
                expires_in: 300,
            })
        );
        assert!(broker.expiry().is_scheduled("s1"));
    }

    #[tokio::test]
    async fn status_uses_stored_admin_token() {
        let fake = FakeProvisioner::new();
        let broker = broker_with(&fake);
        broker.create(CreateSessionRequest::default()).await.unwrap();

        let status = broker.status("s1").await.expect("status");
        assert_eq!(status.status, "running");
        assert!(fake
            .calls()
            .contains(&Call::Get("s1".into(), "admin-s1".into())));
    }

    #[tokio::test]
    async fn unknown_session_is_rejected_without_upstream_call() {
        let fake = FakeProvisioner::new();
        let broker = broker_with(&fake);

        assert!(matches!(
            broker.status("nope").await,
            Err(BrokerError::UnknownSession)
        ));
        assert!(matches!(
            broker.terminate("nope", TerminateMode::Soft).await,
            Err(BrokerError::UnknownSession)
        ));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn terminate_twice_reports_unknown_session() {
        let fake = FakeProvisioner::new();
        let broker = broker_with(&fake);
        broker.create(CreateSessionRequest::default()).await.unwrap();

        broker
            .terminate("s1", TerminateMode::Soft)
            .await
            .expect("first terminate");
        assert!(broker.store().is_empty());
        assert!(!broker.expiry().is_scheduled("s1"));

        assert!(matches!(
            broker.terminate("s1", TerminateMode::Soft).await,
            Err(BrokerError::UnknownSession)
        ));
        assert!(matches!(
            broker.status("s1").await,
            Err(BrokerError::UnknownSession)
        ));
    }

    #[tokio::test]
    async fn hard_terminate_skips_admin_token() {
        let fake = FakeProvisioner::new();
        let broker = broker_with(&fake);
        broker.create(CreateSessionRequest::default()).await.unwrap();

        broker
            .terminate("s1", TerminateMode::Hard)
            .await
            .expect("hard delete");
        assert!(fake.calls().contains(&Call::Delete("s1".into())));
        assert!(!broker.store().contains("s1"));
    }

    #[tokio::test]
    async fn failed_terminate_keeps_record() {
        let fake = FakeProvisioner::new();
        let broker = broker_with(&fake);
        broker.create(CreateSessionRequest::default()).await.unwrap();
        fake.fail_terminations(true);

        let err = broker
            .terminate("s1", TerminateMode::Soft)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Upstream { .. }));
        assert!(broker.store().contains("s1"));
    }

    #[tokio::test]
    async fn upstream_create_failure_stores_nothing() {
        let fake = FakeProvisioner::new();
        fake.fail_next_create(StatusCode::PAYMENT_REQUIRED, "out of credits");
        let broker = broker_with(&fake);

        let err = broker
            .create(CreateSessionRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.client_message(), "out of credits");
        assert!(broker.store().is_empty());
        assert_eq!(broker.expiry().pending(), 0);
    }

    #[tokio::test]
    async fn missing_api_key_is_a_configuration_error() {
        let fake = FakeProvisioner::without_api_key();
        let broker = broker_with(&fake);

        let err = broker
            .create(CreateSessionRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Configuration(_)));
        assert!(fake.live_sessions().is_empty());
    }

    #[tokio::test]
    async fn rejects_invalid_input() {
        let fake = FakeProvisioner::new();
        let broker = broker_with(&fake);

        for request in [
            CreateSessionRequest {
                url: Some("javascript:alert(1)".into()),
                expires_in: None,
            },
            CreateSessionRequest {
                url: Some("not a url".into()),
                expires_in: None,
            },
            CreateSessionRequest {
                url: None,
                expires_in: Some(0),
            },
            CreateSessionRequest {
                url: None,
                expires_in: Some(86_401),
            },
        ] {
            assert!(matches!(
                broker.create(request).await,
                Err(BrokerError::Validation(_))
            ));
        }
        assert!(fake.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_removes_session_after_ttl() {
        let fake = FakeProvisioner::new();
        let broker = broker_with(&fake);

        let created = broker
            .create(CreateSessionRequest {
                url: Some("https://example.com".into()),
                expires_in: Some(2),
            })
            .await
            .unwrap();
        assert_eq!(
            fake.calls()[0],
            Call::Create(CreateVmRequest {
                url: "https://example.com".into(),
                expires_in: 2,
            })
        );
        broker.status(&created.session_id).await.expect("alive");

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(matches!(
            broker.status(&created.session_id).await,
            Err(BrokerError::UnknownSession)
        ));
        assert!(fake
            .calls()
            .contains(&Call::Terminate("s1".into(), "admin-s1".into())));
        assert_eq!(broker.expiry().pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_drops_record_even_when_upstream_fails() {
        let fake = FakeProvisioner::new();
        let broker = broker_with(&fake);
        broker
            .create(CreateSessionRequest {
                url: None,
                expires_in: Some(1),
            })
            .await
            .unwrap();
        fake.fail_terminations(true);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(broker.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_terminate_cancels_expiry() {
        let fake = FakeProvisioner::new();
        let broker = broker_with(&fake);
        broker
            .create(CreateSessionRequest {
                url: None,
                expires_in: Some(5),
            })
            .await
            .unwrap();
        broker.terminate("s1", TerminateMode::Soft).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let terminations = fake
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Terminate(..)))
            .count();
        assert_eq!(terminations, 1);
    }
}
