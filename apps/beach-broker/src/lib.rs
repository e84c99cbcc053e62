//! Brokers remote-browser sessions on behalf of untrusted clients.
//!
//! Clients create, inspect and terminate sessions through a small JSON API
//! while the upstream admin tokens stay in the [`store::CredentialStore`].
//! Every session is terminated automatically once its TTL elapses.

pub mod broker;
pub mod chat;
pub mod config;
pub mod error;
pub mod expiry;
pub mod guard;
pub mod image;
pub mod routes;
pub mod store;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use broker::{BrokerOptions, CreateSessionRequest, CreatedSession, SessionBroker, TerminateMode};
pub use error::{ApiError, BrokerError};
pub use routes::{build_router, AppState, RouterOptions};
