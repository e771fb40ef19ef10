//! Core library for keyport: a client for an API that authenticates with
//! short-lived bearer credentials.
//!
//! The interesting part is keeping the credential alive: [`auth::Session`]
//! owns the stored credentials, [`auth::RefreshCoordinator`] refreshes them
//! with at most one exchange in flight, [`api::ApiClient::send`] retries a
//! rejected call once after refreshing, and [`auth::ProactiveScheduler`]
//! refreshes ahead of expiry.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError};
pub use auth::{Credential, Session, SessionEvent};
pub use config::Config;
