use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::credentials::{CredentialError, CredentialStore, Credentials};

/// Minimum interval between refresh attempts, successful or not.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Owns the credential lifecycle: expiry computation, proactive-refresh
/// detection, and the single-flight protocol that collapses concurrent
/// refresh attempts into one network call.
///
/// The refresh mutex is the single serialization point for all callers
/// needing a fresh token. Letting two refreshes race would consume the same
/// refresh token twice; most backends reject the second use, permanently
/// locking the user out.
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    /// In-memory copy of the persisted state; readers never observe a
    /// half-written record because swaps happen under the write lock.
    cache: RwLock<Option<Credentials>>,
    /// True while a refresh is in flight anywhere in the process.
    refreshing: AtomicBool,
    /// Epoch millis of the last refresh attempt, successful or not.
    last_attempt_ms: AtomicI64,
    /// Held for the duration of refresh network call + token persistence.
    refresh_lock: Mutex<()>,
    min_refresh_interval: Duration,
}

/// Clears the refreshing flag when the refresh critical section ends, even
/// if the future running inside it is dropped mid-await.
struct RefreshFlagGuard<'a>(&'a AtomicBool);

impl Drop for RefreshFlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl TokenManager {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
            refreshing: AtomicBool::new(false),
            last_attempt_ms: AtomicI64::new(0),
            refresh_lock: Mutex::new(()),
            min_refresh_interval: MIN_REFRESH_INTERVAL,
        }
    }

    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Populate the in-memory cache from the persistent store. Called once
    /// at startup; safe to call again after external store changes.
    pub async fn load_from_store(&self) -> Result<(), CredentialError> {
        let loaded = self.store.load().await?;
        *self.cache.write().await = loaded;
        Ok(())
    }

    /// The current access token, only while it is usable (safety buffer not
    /// yet crossed). None signals callers to trigger a refresh.
    pub async fn access_token(&self) -> Option<String> {
        let guard = self.cache.read().await;
        guard
            .as_ref()
            .filter(|c| c.is_usable())
            .map(|c| c.access_token.clone())
    }

    pub async fn refresh_token(&self) -> Option<String> {
        let guard = self.cache.read().await;
        guard.as_ref().map(|c| c.refresh_token.clone())
    }

    pub async fn current(&self) -> Option<Credentials> {
        self.cache.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.cache.read().await.is_some()
    }

    /// True inside the proactive-refresh window: refresh silently in the
    /// background before `access_token` starts returning None.
    pub async fn needs_refresh(&self) -> bool {
        let guard = self.cache.read().await;
        guard
            .as_ref()
            .map(|c| c.needs_proactive_refresh())
            .unwrap_or(false)
    }

    /// Rate-limit gate for refresh attempts. Check-then-set is a single
    /// compare-exchange so two concurrent callers cannot both pass; a
    /// winning call records the attempt regardless of eventual outcome.
    pub fn can_attempt_refresh(&self) -> bool {
        let now = Utc::now().timestamp_millis();
        let min = self.min_refresh_interval.as_millis() as i64;
        loop {
            let last = self.last_attempt_ms.load(Ordering::SeqCst);
            if now.saturating_sub(last) < min {
                return false;
            }
            match self.last_attempt_ms.compare_exchange(
                last,
                now,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    /// Atomically transition the refreshing flag false -> true. Exactly one
    /// caller among concurrent requesters wins; returns false if another
    /// refresh is already in flight or the attempt is rate-limited. A losing
    /// call never consumes the rate-limit window.
    pub fn try_begin_refresh(&self) -> bool {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if !self.can_attempt_refresh() {
            self.refreshing.store(false, Ordering::SeqCst);
            tracing::debug!("Refresh attempt rate-limited");
            return false;
        }
        true
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// Run the refresh critical section (network call + token persistence)
    /// under the refresh mutex. At most one refresh executes concurrently
    /// across all tasks; the refreshing flag is released when the section
    /// ends, whether it succeeds, fails or is cancelled.
    pub async fn with_refresh_lock<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _lock = self.refresh_lock.lock().await;
        let _flag = RefreshFlagGuard(&self.refreshing);
        f().await
    }

    /// Block until any in-flight refresh completes. Used by single-flight
    /// followers: after this returns, the winner's outcome is visible in the
    /// cache (fresh token, or cleared credentials on fatal failure).
    pub async fn wait_for_refresh(&self) {
        let _lock = self.refresh_lock.lock().await;
    }

    /// Persist a refreshed token pair, preserving the identity fields of the
    /// current session. Store write and cache swap happen under the cache
    /// write lock, so readers see either the old or the new state, never a
    /// mix.
    pub async fn save_tokens(
        &self,
        access_token: String,
        refresh_token: String,
        expires_in_seconds: i64,
    ) -> Result<(), CredentialError> {
        let mut guard = self.cache.write().await;

        let mut credentials = Credentials::new(access_token, refresh_token, expires_in_seconds);
        if let Some(previous) = guard.as_ref() {
            credentials.user_id = previous.user_id.clone();
            credentials.user_phone = previous.user_phone.clone();
            credentials.user_role = previous.user_role.clone();
        }

        self.store.save(&credentials).await?;
        *guard = Some(credentials);

        tracing::info!("Tokens refreshed and persisted");
        Ok(())
    }

    /// Persist a full session (login / OTP verification outcome).
    pub async fn save_session(&self, credentials: Credentials) -> Result<(), CredentialError> {
        let mut guard = self.cache.write().await;
        self.store.save(&credentials).await?;
        *guard = Some(credentials);
        tracing::info!("Session established");
        Ok(())
    }

    /// Erase all credential state. Called on logout and whenever the backend
    /// rejects the refresh token (the session is unrecoverable).
    pub async fn clear_tokens(&self) -> Result<(), CredentialError> {
        let mut guard = self.cache.write().await;
        self.store.clear().await?;
        *guard = None;
        tracing::info!("Session cleared, re-authentication required");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;

    fn manager() -> TokenManager {
        TokenManager::new(Arc::new(MemoryCredentialStore::new()))
    }

    #[tokio::test]
    async fn test_access_token_only_when_usable() {
        let tm = manager();
        assert!(tm.access_token().await.is_none());

        tm.save_session(Credentials::new("access", "refresh", 3600))
            .await
            .unwrap();
        assert_eq!(tm.access_token().await.as_deref(), Some("access"));

        // Inside the safety buffer the token is withheld even though it has
        // not technically expired.
        tm.save_session(Credentials::new("access", "refresh", 200))
            .await
            .unwrap();
        assert!(tm.access_token().await.is_none());
        assert!(tm.refresh_token().await.is_some());
    }

    #[tokio::test]
    async fn test_proactive_window_vs_safety_buffer() {
        let tm = manager();

        // 400s of validity: proactive refresh wanted, token still served.
        tm.save_session(Credentials::new("access", "refresh", 400))
            .await
            .unwrap();
        assert!(tm.needs_refresh().await);
        assert_eq!(tm.access_token().await.as_deref(), Some("access"));
    }

    #[tokio::test]
    async fn test_rate_limit_is_check_then_set() {
        let tm = manager().with_min_refresh_interval(Duration::from_secs(30));

        assert!(tm.can_attempt_refresh());
        // Second attempt inside the window is rejected.
        assert!(!tm.can_attempt_refresh());
    }

    #[tokio::test]
    async fn test_rate_limit_reopens_after_interval() {
        let tm = manager().with_min_refresh_interval(Duration::from_millis(50));

        assert!(tm.can_attempt_refresh());
        assert!(!tm.can_attempt_refresh());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(tm.can_attempt_refresh());
    }

    #[tokio::test]
    async fn test_try_begin_refresh_single_winner() {
        let tm = manager();

        assert!(tm.try_begin_refresh());
        assert!(tm.is_refreshing());
        // While in flight, everyone else loses.
        assert!(!tm.try_begin_refresh());

        // Completing the critical section releases the flag.
        tm.with_refresh_lock(|| async {}).await;
        assert!(!tm.is_refreshing());
    }

    #[tokio::test]
    async fn test_losing_try_begin_does_not_consume_rate_limit() {
        let tm = manager().with_min_refresh_interval(Duration::from_secs(30));

        assert!(tm.try_begin_refresh());
        // Loser: flag already held; must not touch the rate-limit window.
        assert!(!tm.try_begin_refresh());
        tm.with_refresh_lock(|| async {}).await;

        // The only recorded attempt is the winner's, so the next attempt is
        // still blocked by the 30s window (one attempt total, not two).
        assert!(!tm.try_begin_refresh());
    }

    #[tokio::test]
    async fn test_refresh_flag_released_on_failure() {
        let tm = manager();

        assert!(tm.try_begin_refresh());
        let result: Result<(), &str> = tm.with_refresh_lock(|| async { Err("backend down") }).await;
        assert!(result.is_err());
        assert!(!tm.is_refreshing());
    }

    #[tokio::test]
    async fn test_concurrent_begin_refresh_exactly_one_winner() {
        let tm = Arc::new(manager());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let tm = Arc::clone(&tm);
            handles.push(tokio::spawn(async move { tm.try_begin_refresh() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_save_tokens_preserves_identity() {
        let tm = manager();

        let mut session = Credentials::new("old-access", "old-refresh", 3600);
        session.user_id = Some("user-1".to_string());
        session.user_phone = Some("+918888888888".to_string());
        session.user_role = Some("driver".to_string());
        tm.save_session(session).await.unwrap();

        tm.save_tokens("new-access".to_string(), "new-refresh".to_string(), 3600)
            .await
            .unwrap();

        let current = tm.current().await.unwrap();
        assert_eq!(current.access_token, "new-access");
        assert_eq!(current.refresh_token, "new-refresh");
        assert_eq!(current.user_id.as_deref(), Some("user-1"));
        assert_eq!(current.user_role.as_deref(), Some("driver"));
    }

    #[tokio::test]
    async fn test_clear_tokens_wipes_cache_and_store() {
        let store = Arc::new(MemoryCredentialStore::new());
        let tm = TokenManager::new(Arc::clone(&store) as Arc<dyn CredentialStore>);

        tm.save_session(Credentials::new("a", "r", 3600)).await.unwrap();
        tm.clear_tokens().await.unwrap();

        assert!(tm.current().await.is_none());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_from_store_populates_cache() {
        let store = Arc::new(MemoryCredentialStore::new());
        store
            .save(&Credentials::new("persisted", "refresh", 3600))
            .await
            .unwrap();

        let tm = TokenManager::new(Arc::clone(&store) as Arc<dyn CredentialStore>);
        assert!(tm.access_token().await.is_none());

        tm.load_from_store().await.unwrap();
        assert_eq!(tm.access_token().await.as_deref(), Some("persisted"));
    }
}
