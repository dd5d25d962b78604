use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Identity;

/// Schema version of the persisted session.
/// Bump together with `SESSION_KEY` whenever `PersistedSession` changes shape.
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Authentication state of one portal profile.
///
/// `is_authenticated` is stored rather than computed on demand, but every
/// mutator re-derives it so it always equals
/// `access_token.is_some() && identity.is_some()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    access_token: Option<String>,
    refresh_token: Option<String>,
    identity: Option<Identity>,
    is_authenticated: bool,
    force_password_change: bool,
}

impl Session {
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated
    }

    pub fn force_password_change(&self) -> bool {
        self.force_password_change
    }

    /// Token and identity both present.
    pub fn is_consistent(&self) -> bool {
        self.access_token.is_some() && self.identity.is_some()
    }

    /// Replace the whole session after a successful login
    pub(crate) fn authenticate(
        &mut self,
        access_token: String,
        refresh_token: String,
        identity: Identity,
        force_password_change: bool,
    ) {
        self.access_token = Some(access_token);
        self.refresh_token = Some(refresh_token);
        self.identity = Some(identity);
        self.force_password_change = force_password_change;
        self.sync_authenticated();
    }

    /// Swap in a freshly minted access token, leaving everything else alone
    pub(crate) fn replace_access_token(&mut self, access_token: String) {
        self.access_token = Some(access_token);
        self.sync_authenticated();
    }

    pub(crate) fn set_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
        self.sync_authenticated();
    }

    pub(crate) fn set_force_password_change(&mut self, required: bool) {
        self.force_password_change = required;
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    fn sync_authenticated(&mut self) {
        self.is_authenticated = self.is_consistent();
    }

    pub(crate) fn to_persisted(&self) -> PersistedSession {
        PersistedSession {
            version: SESSION_SCHEMA_VERSION,
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            identity: self.identity.clone(),
            force_password_change: self.force_password_change,
            saved_at: Utc::now(),
        }
    }

    /// Rebuild a session from storage. Returns None for other schema versions.
    pub(crate) fn from_persisted(persisted: PersistedSession) -> Option<Self> {
        if persisted.version != SESSION_SCHEMA_VERSION {
            return None;
        }
        let mut session = Self {
            access_token: persisted.access_token,
            refresh_token: persisted.refresh_token,
            identity: persisted.identity,
            is_authenticated: false,
            force_password_change: persisted.force_password_change,
        };
        session.sync_authenticated();
        Some(session)
    }
}

/// Serialized form of a `Session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub version: u32,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub identity: Option<Identity>,
    #[serde(default)]
    pub force_password_change: bool,
    pub saved_at: DateTime<Utc>,
}
