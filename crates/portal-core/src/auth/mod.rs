//! Authentication state for the portal.
//!
//! This module provides:
//! - `Session`: access token, refresh token and identity of the signed-in user
//! - `SessionStore`: the single owner of the live session, with a
//!   single-flight token refresh
//! - `SessionStorage`: durable backends (file, OS keychain, memory)
//! - `gate`: the password-change gate and route guard
//!
//! Sessions are persisted under a versioned key so values written by an
//! older schema are never restored.

pub mod gate;
pub mod session;
pub mod storage;
pub mod store;

pub use gate::{GateState, RouteDecision, PASSWORD_GATE_ROUTE, SIGN_IN_ROUTE, SIGN_OUT_ROUTE};
pub use session::{PersistedSession, Session, SESSION_SCHEMA_VERSION};
pub use storage::{FileStorage, KeyringStorage, MemoryStorage, SessionStorage, SESSION_KEY, STORAGE_NAMESPACE};
pub use store::{Navigator, SessionStore, TokenRefresher, TracingNavigator};
