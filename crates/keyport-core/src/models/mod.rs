//! Wire models for the authentication API.
//!
//! - `AuthResponse`: token envelope returned by login, registration and refresh
//! - `Profile`: the authenticated user's account summary

pub mod auth;

pub use auth::{AuthResponse, LoginRequest, Profile, ProfileResponse, RefreshRequest, RegisterRequest};
