use std::time::Duration;

use dashmap::DashMap;
use time::OffsetDateTime;

/// Server-side record for a session created by this broker.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub admin_token: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl SessionRecord {
    pub fn new(admin_token: String, ttl: Duration) -> Self {
        let created_at = OffsetDateTime::now_utc();
        Self {
            admin_token,
            created_at,
            expires_at: created_at + ttl,
        }
    }
}

/// Maps `session_id` to the admin credential upstream issued for it.
///
/// Entries are written once at creation and removed once at termination, so
/// per-entry locking from the map is all the coordination required.
#[derive(Debug, Default)]
pub struct CredentialStore {
    sessions: DashMap<String, SessionRecord>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, session_id: impl Into<String>, record: SessionRecord) -> Option<SessionRecord> {
        self.sessions.insert(session_id.into(), record)
    }

    pub fn get(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.admin_token.clone())
    }

    pub fn record(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.remove(session_id).map(|(_, record)| record)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
