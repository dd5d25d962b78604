//! Session and request-resilience layer for the reseller portal.
//!
//! - `auth`: the session store, its persisted storage and the
//!   password-change gate
//! - `api`: the request pipeline (token injection, 401 refresh, backoff)
//! - `models`: identity and role
//! - `config`: on-disk configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

#[cfg(test)]
mod test_support;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse};
pub use auth::{Session, SessionStore};
pub use config::Config;
pub use models::{Identity, Role};
