//! REST API client module for the keyport service.
//!
//! This module provides the `ApiClient` for authenticated calls with
//! transparent credential refresh, and the `HttpTokenRefresher` used for
//! the refresh exchange itself.
//!
//! The API uses JWT bearer token authentication obtained through the
//! `/api/auth/login/` endpoint.

pub mod client;
pub mod error;
pub mod refresh;

pub use client::ApiClient;
pub use error::ApiError;
pub use refresh::HttpTokenRefresher;
pub use reqwest::Method;
