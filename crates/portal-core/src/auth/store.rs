use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::models::Identity;

use super::gate::{self, GateState, RouteDecision, SIGN_IN_ROUTE};
use super::session::{PersistedSession, Session};
use super::storage::{SessionStorage, SESSION_KEY};

/// Exchanges a refresh token for a new access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<String>;
}

/// Performs the hard navigation that follows a sign-out.
pub trait Navigator: Send + Sync {
    fn navigate(&self, route: &str);
}

/// Navigator for headless use: logs the target and remembers it
#[derive(Default)]
pub struct TracingNavigator {
    last_route: StdMutex<Option<String>>,
}

impl TracingNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_route(&self) -> Option<String> {
        self.last_route
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Navigator for TracingNavigator {
    fn navigate(&self, route: &str) {
        info!(route, "Navigating");
        *self.last_route.lock().unwrap_or_else(|e| e.into_inner()) = Some(route.to_string());
    }
}

type PendingRefresh = Shared<BoxFuture<'static, Option<String>>>;

struct StoreInner {
    session: RwLock<Session>,
    /// The refresh exchange currently in flight, shared by every caller
    pending_refresh: Mutex<Option<PendingRefresh>>,
    storage: Arc<dyn SessionStorage>,
    refresher: Arc<dyn TokenRefresher>,
    navigator: Arc<dyn Navigator>,
}

/// Owner of the live session.
///
/// Nothing outside this type touches session fields directly; every
/// transition goes through one of its operations and is persisted before
/// the lock is released. Clone is cheap and all clones share one session.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    /// Create a signed-out store. Call `hydrate` to restore a saved session.
    pub fn new(
        storage: Arc<dyn SessionStorage>,
        refresher: Arc<dyn TokenRefresher>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                session: RwLock::new(Session::default()),
                pending_refresh: Mutex::new(None),
                storage,
                refresher,
                navigator,
            }),
        }
    }

    /// Load the persisted session, if any.
    ///
    /// A corrupt value or one written under another schema version is
    /// treated as absent and wiped. Returns whether an authenticated
    /// session was restored.
    pub async fn hydrate(&self) -> bool {
        let raw = match self.inner.storage.read(SESSION_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("No persisted session");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read persisted session");
                return false;
            }
        };

        let restored = serde_json::from_str::<PersistedSession>(&raw)
            .ok()
            .and_then(Session::from_persisted);

        let mut session = self.inner.session.write().await;
        match restored {
            Some(restored) => {
                let authenticated = restored.is_authenticated();
                *session = restored;
                debug!(authenticated, "Session restored");
                authenticated
            }
            None => {
                warn!("Discarding unreadable persisted session");
                session.clear();
                self.inner.wipe();
                false
            }
        }
    }

    /// Replace the whole session after a successful sign-in.
    ///
    /// `force_password_change` gates the session behind the password-change
    /// route; passing `false` clears any earlier gate.
    pub async fn set_auth(
        &self,
        access_token: String,
        refresh_token: String,
        identity: Identity,
        force_password_change: bool,
    ) {
        info!(user = %identity.email, role = %identity.role, force_password_change, "Signed in");
        let mut session = self.inner.session.write().await;
        session.authenticate(access_token, refresh_token, identity, force_password_change);
        self.inner.persist(&session);
    }

    /// Clear the session, wipe storage and navigate to sign-in. Idempotent.
    pub async fn logout(&self) {
        self.inner.logout().await;
    }

    /// Validate the session. An inconsistent session is cleared.
    pub async fn check_auth(&self) -> bool {
        let mut session = self.inner.session.write().await;
        if session.is_consistent() {
            return true;
        }
        if *session != Session::default() {
            warn!("Session missing token or identity, clearing");
        }
        session.clear();
        self.inner.wipe();
        false
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// Concurrent callers share one exchange and all observe its result.
    /// Returns `None` when the session ended, in which case `logout` has
    /// already run.
    pub async fn refresh_access_token(&self) -> Option<String> {
        let pending = {
            let mut slot = self.inner.pending_refresh.lock().await;
            match slot.as_ref() {
                Some(pending) => {
                    debug!("Joining in-flight token refresh");
                    pending.clone()
                }
                None => {
                    let pending = Arc::clone(&self.inner).exchange().boxed().shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        let result = pending.clone().await;

        let mut slot = self.inner.pending_refresh.lock().await;
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&pending)) {
            *slot = None;
        }
        result
    }

    /// Update the identity, e.g. after re-reading `/auth/me`
    pub async fn set_identity(&self, identity: Identity) {
        let mut session = self.inner.session.write().await;
        if !session.is_authenticated() {
            debug!("Ignoring identity update for signed-out session");
            return;
        }
        session.set_identity(identity);
        self.inner.persist(&session);
    }

    /// Raise or lower the password-change gate as reported by the backend
    pub async fn set_force_password_change(&self, required: bool) {
        let mut session = self.inner.session.write().await;
        if !session.is_authenticated() || session.force_password_change() == required {
            return;
        }
        session.set_force_password_change(required);
        self.inner.persist(&session);
    }

    /// Gated -> Normal after the password change succeeded
    pub async fn complete_password_change(&self) {
        info!("Password change completed");
        self.set_force_password_change(false).await;
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner.session.read().await.access_token().map(str::to_owned)
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.inner.session.read().await.identity().cloned()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.session.read().await.is_authenticated()
    }

    /// Copy of the current session
    pub async fn snapshot(&self) -> Session {
        self.inner.session.read().await.clone()
    }

    pub async fn gate_state(&self) -> GateState {
        GateState::of(&*self.inner.session.read().await)
    }

    /// Route guard for the current session
    pub async fn guard(&self, route: &str) -> RouteDecision {
        let session = self.inner.session.read().await;
        gate::guard(GateState::of(&session), session.identity(), route)
    }
}

impl StoreInner {
    async fn exchange(self: Arc<Self>) -> Option<String> {
        let refresh_token = self
            .session
            .read()
            .await
            .refresh_token()
            .map(str::to_owned);

        let Some(refresh_token) = refresh_token else {
            warn!("No refresh token available, ending session");
            self.end_session(false).await;
            return None;
        };

        debug!("Refreshing access token");
        let outcome = self.refresher.refresh(&refresh_token).await;

        let mut session = self.session.write().await;
        // A logout or a new sign-in happened while the exchange was in flight
        if session.refresh_token() != Some(refresh_token.as_str()) {
            debug!("Session changed during token refresh, discarding result");
            return None;
        }

        match outcome {
            Ok(access_token) => {
                session.replace_access_token(access_token.clone());
                self.persist(&session);
                info!("Access token refreshed");
                Some(access_token)
            }
            Err(e) => {
                drop(session);
                warn!(error = %e, "Token refresh failed, ending session");
                self.end_session(false).await;
                None
            }
        }
    }

    async fn logout(&self) {
        self.end_session(true).await;
    }

    /// Clear and wipe the session, then navigate to sign-in. With
    /// `always_navigate` unset, an already signed-out session is not
    /// navigated away from a second time.
    async fn end_session(&self, always_navigate: bool) {
        let was_signed_in = {
            let mut session = self.session.write().await;
            let was_signed_in = *session != Session::default();
            session.clear();
            self.wipe();
            was_signed_in
        };
        if was_signed_in {
            info!("Signed out");
        }
        if was_signed_in || always_navigate {
            self.navigator.navigate(SIGN_IN_ROUTE);
        }
    }

    fn persist(&self, session: &Session) {
        let result = serde_json::to_string(&session.to_persisted())
            .map_err(anyhow::Error::from)
            .and_then(|json| self.storage.write(SESSION_KEY, &json));
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist session");
        }
    }

    fn wipe(&self) {
        if let Err(e) = self.storage.remove(SESSION_KEY) {
            warn!(error = %e, "Failed to wipe persisted session");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::storage::MemoryStorage;
    use crate::models::Role;
    use crate::test_support::{identity, CountingRefresher, RecordingNavigator};

    struct Fixture {
        store: SessionStore,
        storage: Arc<MemoryStorage>,
        refresher: Arc<CountingRefresher>,
        navigator: Arc<RecordingNavigator>,
    }

    fn fixture(refresher: CountingRefresher) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let refresher = Arc::new(refresher);
        let navigator = Arc::new(RecordingNavigator::default());
        let store = SessionStore::new(storage.clone(), refresher.clone(), navigator.clone());
        Fixture {
            store,
            storage,
            refresher,
            navigator,
        }
    }

    #[tokio::test]
    async fn test_set_auth_then_check_auth() {
        let f = fixture(CountingRefresher::succeeding("new"));
        f.store
            .set_auth("access".into(), "refresh".into(), identity(Role::Client), false)
            .await;

        assert!(f.store.check_auth().await);
        assert!(f.store.is_authenticated().await);
        assert!(f.storage.read(SESSION_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_logout_clears_storage_and_navigates() {
        let f = fixture(CountingRefresher::succeeding("new"));
        f.store
            .set_auth("access".into(), "refresh".into(), identity(Role::Admin), false)
            .await;

        f.store.logout().await;
        f.store.logout().await;

        assert!(!f.store.check_auth().await);
        assert_eq!(f.storage.read(SESSION_KEY).unwrap(), None);
        assert_eq!(f.navigator.routes(), vec!["/login".to_string(), "/login".to_string()]);
    }

    #[tokio::test]
    async fn test_hydrate_restores_persisted_session() {
        let f = fixture(CountingRefresher::succeeding("new"));
        f.store
            .set_auth("access".into(), "refresh".into(), identity(Role::Investor), true)
            .await;

        let navigator = Arc::new(RecordingNavigator::default());
        let reloaded = SessionStore::new(f.storage.clone(), f.refresher.clone(), navigator);
        assert!(reloaded.hydrate().await);
        assert_eq!(reloaded.access_token().await.as_deref(), Some("access"));
        assert_eq!(reloaded.gate_state().await, GateState::Gated);
    }

    #[tokio::test]
    async fn test_hydrate_treats_corrupt_value_as_absent() {
        let f = fixture(CountingRefresher::succeeding("new"));
        f.storage.write(SESSION_KEY, "{not json").unwrap();

        assert!(!f.store.hydrate().await);
        assert!(!f.store.is_authenticated().await);
        assert_eq!(f.storage.read(SESSION_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_hydrate_ignores_legacy_keys() {
        let f = fixture(CountingRefresher::succeeding("new"));
        f.storage
            .write("session.v0", r#"{"token": "old", "user": {"id": 1}}"#)
            .unwrap();

        assert!(!f.store.hydrate().await);
        assert!(!f.store.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_check_auth_heals_inconsistent_session() {
        let f = fixture(CountingRefresher::succeeding("new"));
        let stored = serde_json::json!({
            "version": 1,
            "access_token": "access",
            "refresh_token": "refresh",
            "identity": null,
            "force_password_change": false,
            "saved_at": "2026-01-01T00:00:00Z"
        });
        f.storage.write(SESSION_KEY, &stored.to_string()).unwrap();

        assert!(!f.store.hydrate().await);
        assert!(!f.store.check_auth().await);
        assert_eq!(f.store.snapshot().await, Session::default());
        assert_eq!(f.storage.read(SESSION_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_refresh_replaces_only_access_token() {
        let f = fixture(CountingRefresher::succeeding("fresh"));
        f.store
            .set_auth("stale".into(), "refresh".into(), identity(Role::Client), false)
            .await;

        assert_eq!(f.store.refresh_access_token().await.as_deref(), Some("fresh"));

        let session = f.store.snapshot().await;
        assert_eq!(session.access_token(), Some("fresh"));
        assert_eq!(session.refresh_token(), Some("refresh"));
        assert_eq!(session.identity(), Some(&identity(Role::Client)));
        assert_eq!(f.refresher.seen_tokens(), vec!["refresh".to_string()]);
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_skips_exchange() {
        let f = fixture(CountingRefresher::succeeding("fresh"));

        assert_eq!(f.store.refresh_access_token().await, None);
        assert_eq!(f.refresher.calls(), 0);
        assert!(!f.store.is_authenticated().await);
        // Already signed out: no second trip to sign-in
        assert!(f.navigator.routes().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_after_logout_does_not_navigate_again() {
        let f = fixture(CountingRefresher::succeeding("fresh"));
        f.store
            .set_auth("access".into(), "refresh".into(), identity(Role::Client), false)
            .await;

        f.store.logout().await;
        assert_eq!(f.store.refresh_access_token().await, None);

        assert_eq!(f.refresher.calls(), 0);
        assert_eq!(f.navigator.routes(), vec!["/login".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_refresh_logs_out() {
        let f = fixture(CountingRefresher::failing("refresh token revoked"));
        f.store
            .set_auth("stale".into(), "refresh".into(), identity(Role::Client), false)
            .await;

        assert_eq!(f.store.refresh_access_token().await, None);
        assert!(!f.store.is_authenticated().await);
        assert_eq!(f.storage.read(SESSION_KEY).unwrap(), None);
        assert_eq!(f.navigator.routes(), vec!["/login".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_share_one_exchange() {
        let f = fixture(CountingRefresher::succeeding("fresh").with_delay(Duration::from_millis(50)));
        f.store
            .set_auth("stale".into(), "refresh".into(), identity(Role::Client), false)
            .await;

        let (a, b, c, d) = tokio::join!(
            f.store.refresh_access_token(),
            f.store.refresh_access_token(),
            f.store.refresh_access_token(),
            f.store.refresh_access_token(),
        );

        assert_eq!(f.refresher.calls(), 1);
        for token in [a, b, c, d] {
            assert_eq!(token.as_deref(), Some("fresh"));
        }

        // The slot is released once the exchange resolves
        assert_eq!(f.store.refresh_access_token().await.as_deref(), Some("fresh"));
        assert_eq!(f.refresher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_caller_joins_suspended_exchange() {
        let f = fixture(CountingRefresher::succeeding("fresh").with_delay(Duration::from_millis(50)));
        f.store
            .set_auth("stale".into(), "refresh".into(), identity(Role::Client), false)
            .await;

        let late = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.store.refresh_access_token().await
        };
        let (first, second) = tokio::join!(f.store.refresh_access_token(), late);

        assert_eq!(first.as_deref(), Some("fresh"));
        assert_eq!(second.as_deref(), Some("fresh"));
        assert_eq!(f.refresher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_refresh_is_not_undone() {
        let f = fixture(CountingRefresher::succeeding("fresh").with_delay(Duration::from_millis(50)));
        f.store
            .set_auth("stale".into(), "refresh".into(), identity(Role::Client), false)
            .await;

        let logout = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.store.logout().await;
        };
        let (token, ()) = tokio::join!(f.store.refresh_access_token(), logout);

        assert_eq!(token, None);
        assert_eq!(f.store.access_token().await, None);
        assert_eq!(f.storage.read(SESSION_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_password_change_lifts_gate() {
        let f = fixture(CountingRefresher::succeeding("fresh"));
        f.store
            .set_auth("access".into(), "refresh".into(), identity(Role::Client), true)
            .await;

        assert_eq!(
            f.store.guard("/client/balance").await,
            RouteDecision::Redirect("/change-password")
        );

        f.store.complete_password_change().await;
        assert_eq!(f.store.gate_state().await, GateState::Normal);
        assert_eq!(f.store.guard("/client/balance").await, RouteDecision::Allow);
    }

    #[tokio::test]
    async fn test_set_auth_without_flag_clears_gate() {
        let f = fixture(CountingRefresher::succeeding("fresh"));
        f.store
            .set_auth("a".into(), "r".into(), identity(Role::Client), true)
            .await;
        f.store
            .set_auth("b".into(), "s".into(), identity(Role::Client), false)
            .await;
        assert_eq!(f.store.gate_state().await, GateState::Normal);
    }

    #[test]
    fn test_tracing_navigator_remembers_last_route() {
        let navigator = TracingNavigator::new();
        assert_eq!(navigator.last_route(), None);
        navigator.navigate("/login");
        assert_eq!(navigator.last_route().as_deref(), Some("/login"));
    }
}
