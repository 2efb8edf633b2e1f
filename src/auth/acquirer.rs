use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use super::browser::LoginDriver;
use super::store::TokenStore;
use super::types::{
    now_epoch, CachedCredential, Scope, TokenRecord, REFRESH_TOKEN_LIFETIME_SECS,
};
use crate::error::{BrokerError, Result};

/// Login flow state as observed by `/api/status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireState {
    Idle,
    AwaitingLogin,
    Acquired,
    Aborted,
}

type LoginFlight = Shared<BoxFuture<'static, Result<TokenRecord>>>;

/// Obtains the refresh credential through interactive login.
///
/// At most one login runs at a time: concurrent callers join the flight in
/// progress and all observe its outcome. The flight runs on its own task, so
/// a caller giving up does not cancel the browser session for the others.
pub struct CredentialAcquirer {
    store: Arc<TokenStore>,
    driver: Arc<dyn LoginDriver>,
    login_timeout: Duration,
    expiry_skew: i64,
    state: Arc<watch::Sender<AcquireState>>,
    in_flight: Mutex<Option<LoginFlight>>,
}

impl CredentialAcquirer {
    pub fn new(
        store: Arc<TokenStore>,
        driver: Arc<dyn LoginDriver>,
        login_timeout: Duration,
        expiry_skew: i64,
    ) -> Self {
        let (state, _) = watch::channel(AcquireState::Idle);
        Self {
            store,
            driver,
            login_timeout,
            expiry_skew,
            state: Arc::new(state),
            in_flight: Mutex::new(None),
        }
    }

    pub fn state(&self) -> AcquireState {
        *self.state.borrow()
    }

    /// Run (or join) an interactive login and store the captured refresh credential.
    ///
    /// A credential committed by a flight that finished while this caller was
    /// on its way here is returned as is, without opening another browser.
    pub async fn acquire(&self) -> Result<TokenRecord> {
        let flight = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(flight) => {
                    tracing::debug!("Joining login already in progress");
                    flight.clone()
                }
                None => {
                    if let Some(record) = self.stored_credential().await {
                        tracing::debug!("Refresh token already captured, skipping login");
                        return Ok(record);
                    }
                    let flight = self.start_flight();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };

        let outcome = flight.clone().await;

        let mut slot = self.in_flight.lock().await;
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&flight)) {
            *slot = None;
        }
        outcome
    }

    async fn stored_credential(&self) -> Option<TokenRecord> {
        let record = self.store.get(&Scope::RefreshCredential).await?;
        (!record.is_expired_at(now_epoch() + self.expiry_skew)).then_some(record)
    }

    fn start_flight(&self) -> LoginFlight {
        let store = self.store.clone();
        let driver = self.driver.clone();
        let state = self.state.clone();
        let login_timeout = self.login_timeout;

        let task = tokio::spawn(async move {
            state.send_replace(AcquireState::AwaitingLogin);
            let outcome = run_login(&store, driver.as_ref(), login_timeout).await;
            state.send_replace(match outcome {
                Ok(_) => AcquireState::Acquired,
                Err(_) => AcquireState::Aborted,
            });
            outcome
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(BrokerError::LoginAborted(format!("login task failed: {}", e))),
            }
        }
        .boxed()
        .shared()
    }
}

async fn run_login(
    store: &TokenStore,
    driver: &dyn LoginDriver,
    login_timeout: Duration,
) -> Result<TokenRecord> {
    tracing::info!("Refresh token missing or expired, starting interactive login");

    let storage = match tokio::time::timeout(login_timeout, driver.capture_local_storage()).await {
        Ok(Ok(storage)) => storage,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Interactive login failed");
            return Err(e);
        }
        Err(_) => {
            tracing::error!("Interactive login timed out");
            return Err(BrokerError::LoginTimedOut {
                secs: login_timeout.as_secs(),
            });
        }
    };

    let secret = find_refresh_secret(&storage).ok_or_else(|| {
        BrokerError::LoginAborted("no refresh token found in browser storage".to_string())
    })?;

    let record = TokenRecord::valid_for(secret, REFRESH_TOKEN_LIFETIME_SECS);
    store.set(&Scope::RefreshCredential, record.clone()).await?;
    tracing::info!(expires = record.expires, "Refresh token captured");
    Ok(record)
}

/// Secret of the first local storage entry describing a refresh token
fn find_refresh_secret(storage: &HashMap<String, String>) -> Option<String> {
    storage.values().find_map(|raw| {
        let credential: CachedCredential = serde_json::from_str(raw).ok()?;
        if credential.credential_type == "RefreshToken" {
            credential.secret.filter(|s| !s.is_empty())
        } else {
            None
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Driver returning canned storage after a delay, counting launches
    pub(crate) struct FakeDriver {
        pub launches: AtomicUsize,
        pub delay: Duration,
        pub storage: HashMap<String, String>,
    }

    impl FakeDriver {
        pub(crate) fn with_refresh_token(secret: &str) -> Self {
            let mut storage = HashMap::new();
            storage.insert(
                "msal.token.keys".to_string(),
                r#"{"idToken":["a"]}"#.to_string(),
            );
            storage.insert(
                "uid.tid-login.windows.net-refreshtoken-client--".to_string(),
                format!(r#"{{"credentialType":"RefreshToken","secret":"{}"}}"#, secret),
            );
            Self {
                launches: AtomicUsize::new(0),
                delay: Duration::from_millis(50),
                storage,
            }
        }
    }

    #[async_trait]
    impl LoginDriver for FakeDriver {
        async fn capture_local_storage(&self) -> Result<HashMap<String, String>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.storage.clone())
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> Arc<TokenStore> {
        Arc::new(TokenStore::with_entries(
            dir.path().join("tokens.json"),
            HashMap::new(),
        ))
    }

    fn acquirer_with(
        store: Arc<TokenStore>,
        driver: Arc<FakeDriver>,
        login_timeout: Duration,
    ) -> CredentialAcquirer {
        CredentialAcquirer::new(store, driver, login_timeout, 0)
    }

    #[tokio::test]
    async fn test_concurrent_acquire_launches_one_login() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let driver = Arc::new(FakeDriver::with_refresh_token("rt-1"));
        let acquirer = acquirer_with(store.clone(), driver.clone(), Duration::from_secs(5));

        let results = futures::future::join_all((0..5).map(|_| acquirer.acquire())).await;

        assert_eq!(driver.launches.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap().secret, "rt-1");
        }
        assert_eq!(acquirer.state(), AcquireState::Acquired);
        assert_eq!(
            store.get(&Scope::RefreshCredential).await.unwrap().secret,
            "rt-1"
        );
    }

    #[tokio::test]
    async fn test_expired_credential_starts_new_login() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let driver = Arc::new(FakeDriver::with_refresh_token("rt-2"));
        let acquirer = acquirer_with(store.clone(), driver.clone(), Duration::from_secs(5));

        acquirer.acquire().await.unwrap();
        store
            .set(&Scope::RefreshCredential, TokenRecord::new("old", 10))
            .await
            .unwrap();
        acquirer.acquire().await.unwrap();
        assert_eq!(driver.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_credential_committed_before_lock_skips_login() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .set(
                &Scope::RefreshCredential,
                TokenRecord::valid_for("just-captured", 3600),
            )
            .await
            .unwrap();
        let driver = Arc::new(FakeDriver::with_refresh_token("unused"));
        let acquirer = acquirer_with(store, driver.clone(), Duration::from_secs(5));

        let record = acquirer.acquire().await.unwrap();
        assert_eq!(record.secret, "just-captured");
        assert_eq!(driver.launches.load(Ordering::SeqCst), 0);
        assert_eq!(acquirer.state(), AcquireState::Idle);
    }

    #[tokio::test]
    async fn test_credential_inside_skew_starts_login() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .set(&Scope::RefreshCredential, TokenRecord::valid_for("stale", 30))
            .await
            .unwrap();
        let driver = Arc::new(FakeDriver::with_refresh_token("rt-3"));
        let acquirer =
            CredentialAcquirer::new(store, driver.clone(), Duration::from_secs(5), 60);

        assert_eq!(acquirer.acquire().await.unwrap().secret, "rt-3");
        assert_eq!(driver.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_credential_lifetime_is_one_day() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::with_refresh_token("rt"));
        let acquirer = acquirer_with(store_in(&dir), driver, Duration::from_secs(5));

        let before = crate::auth::types::now_epoch();
        let record = acquirer.acquire().await.unwrap();
        assert!(record.expires >= before + REFRESH_TOKEN_LIFETIME_SECS);
        assert!(record.expires <= before + REFRESH_TOKEN_LIFETIME_SECS + 5);
    }

    #[tokio::test]
    async fn test_storage_without_refresh_token_is_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut driver = FakeDriver::with_refresh_token("unused");
        driver.storage.retain(|key, _| key == "msal.token.keys");
        let acquirer = acquirer_with(store.clone(), Arc::new(driver), Duration::from_secs(5));

        let err = acquirer.acquire().await.unwrap_err();
        assert!(matches!(err, BrokerError::LoginAborted(_)));
        assert_eq!(acquirer.state(), AcquireState::Aborted);
        assert!(store.get(&Scope::RefreshCredential).await.is_none());
    }

    #[tokio::test]
    async fn test_slow_login_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = FakeDriver::with_refresh_token("late");
        driver.delay = Duration::from_secs(5);
        let acquirer = acquirer_with(store_in(&dir), Arc::new(driver), Duration::from_millis(50));

        let err = acquirer.acquire().await.unwrap_err();
        assert!(matches!(err, BrokerError::LoginTimedOut { .. }));
    }

    #[test]
    fn test_find_refresh_secret_skips_other_credentials() {
        let mut storage = HashMap::new();
        storage.insert(
            "access".to_string(),
            r#"{"credentialType":"AccessToken","secret":"at"}"#.to_string(),
        );
        storage.insert("plain".to_string(), "not json".to_string());
        assert_eq!(find_refresh_secret(&storage), None);

        storage.insert(
            "refresh".to_string(),
            r#"{"credentialType":"RefreshToken","secret":"rt"}"#.to_string(),
        );
        assert_eq!(find_refresh_secret(&storage).as_deref(), Some("rt"));
    }
}
