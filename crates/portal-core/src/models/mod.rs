//! Data models shared by the session store and the request pipeline.
//!
//! - `Identity`: the authenticated principal returned by `/auth/me`
//! - `Role`: which area of the dashboard the principal may use

pub mod identity;

pub use identity::{Identity, Role};
