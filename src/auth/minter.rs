use std::sync::Arc;

use super::acquirer::CredentialAcquirer;
use super::exchange::{self, IdentityClient};
use super::store::TokenStore;
use super::types::{now_epoch, Scope, TokenRecord};
use crate::config::{Config, Endpoints};
use crate::error::Result;
use crate::http_client::BrokerHttpClient;

/// Hands out valid credentials per scope, minting and caching on demand.
///
/// Each scope is minted from the one it depends on (see [`Scope::depends_on`]).
/// A fresh record is written to the store only after the whole exchange
/// succeeded; a failed exchange leaves the previous record in place.
pub struct TokenMinter {
    store: Arc<TokenStore>,
    acquirer: Arc<CredentialAcquirer>,
    http: BrokerHttpClient,
    endpoints: Endpoints,
    identity: IdentityClient,
    /// Seconds before `expires` at which a record is already treated as expired
    expiry_skew: i64,
}

impl TokenMinter {
    pub fn new(
        store: Arc<TokenStore>,
        acquirer: Arc<CredentialAcquirer>,
        http: BrokerHttpClient,
        config: &Config,
    ) -> Self {
        Self {
            store,
            acquirer,
            http,
            endpoints: config.endpoints.clone(),
            identity: IdentityClient {
                client_id: config.client_id.clone(),
                tenant_id: config.tenant_id.clone(),
            },
            expiry_skew: config.token_expiry_skew as i64,
        }
    }

    /// Valid credential for `scope`.
    ///
    /// `SiteCookie` is bound to a site section and is minted through
    /// [`TokenMinter::ensure_site_cookie`]; here it is only served from cache.
    /// `SiteRoot` holds a URL and goes through [`TokenMinter::ensure_site_root`].
    pub async fn ensure(&self, scope: &Scope) -> Result<TokenRecord> {
        match scope {
            Scope::RefreshCredential => self.ensure_refresh_credential().await,
            Scope::Resource(_) => self.ensure_resource(scope).await,
            Scope::SessionToken => self.ensure_session_token().await,
            Scope::SiteCookie => self.cached(scope).await.ok_or_else(|| {
                anyhow::anyhow!("site cookie must be minted for a site section").into()
            }),
            Scope::SiteRoot => {
                Err(anyhow::anyhow!("{} holds a URL, not a token", scope).into())
            }
        }
    }

    /// SharePoint root URL, resolved once and cached without expiry
    pub async fn ensure_site_root(&self) -> Result<String> {
        if let Some(url) = self.store.site_root().await {
            return Ok(url);
        }

        let bearer = self.ensure_resource(&Scope::authorization()).await?;
        let url = exchange::resolve_site_root(&self.http, &self.endpoints, &bearer.secret).await?;
        self.store.set_site_root(url.clone()).await?;
        tracing::info!(web_url = %url, "SharePoint root URL resolved");
        Ok(url)
    }

    /// SharePoint session cookie for `section`. One cookie is cached for the
    /// whole site.
    pub async fn ensure_site_cookie(&self, section: &str) -> Result<TokenRecord> {
        let scope = Scope::SiteCookie;
        if let Some(record) = self.cached(&scope).await {
            return Ok(record);
        }

        let web_url = self.ensure_site_root().await?;
        let site_bearer = self.ensure_resource(&Scope::site(&web_url)).await?;
        let record =
            exchange::exchange_site_cookie(&self.http, &web_url, section, &site_bearer.secret)
                .await?;
        self.store.set(&scope, record.clone()).await?;
        Ok(record)
    }

    /// Stored record for `scope` if it is still usable
    async fn cached(&self, scope: &Scope) -> Option<TokenRecord> {
        let record = self.store.get(scope).await?;
        if record.is_expired_at(now_epoch() + self.expiry_skew) {
            tracing::debug!(scope = %scope, expires = record.expires, "Cached token expired");
            None
        } else {
            tracing::trace!(scope = %scope, "Using cached token");
            Some(record)
        }
    }

    async fn ensure_refresh_credential(&self) -> Result<TokenRecord> {
        match self.cached(&Scope::RefreshCredential).await {
            Some(record) => Ok(record),
            None => self.acquirer.acquire().await,
        }
    }

    async fn ensure_resource(&self, scope: &Scope) -> Result<TokenRecord> {
        if let Some(record) = self.cached(scope).await {
            return Ok(record);
        }

        let refresh = self.ensure_refresh_credential().await?;
        let record = exchange::refresh_resource_token(
            &self.http,
            &self.endpoints,
            &self.identity,
            &refresh.secret,
            scope,
        )
        .await?;
        self.store.set(scope, record.clone()).await?;
        Ok(record)
    }

    async fn ensure_session_token(&self) -> Result<TokenRecord> {
        let scope = Scope::SessionToken;
        if let Some(record) = self.cached(&scope).await {
            return Ok(record);
        }

        let bearer = self.ensure_resource(&Scope::authorization()).await?;
        let record =
            exchange::exchange_skype_token(&self.http, &self.endpoints, &bearer.secret).await?;
        self.store.set(&scope, record.clone()).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::acquirer::tests::FakeDriver;
    use crate::auth::types::{StoredEntry, AUTHORIZATION_SCOPE};
    use crate::error::BrokerError;
    use mockito::Matcher;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<TokenStore>,
        driver: Arc<FakeDriver>,
        minter: TokenMinter,
    }

    fn harness(base: &str, entries: Vec<(&str, StoredEntry)>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_testing(base, dir.path().join("tokens.json"));
        let entries: HashMap<String, StoredEntry> = entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let store = Arc::new(TokenStore::with_entries(config.token_file.clone(), entries));
        let driver = Arc::new(FakeDriver::with_refresh_token("fresh-rt"));
        let acquirer = Arc::new(CredentialAcquirer::new(
            store.clone(),
            driver.clone(),
            Duration::from_secs(5),
            0,
        ));
        let http = BrokerHttpClient::new(5, 10).unwrap();
        let minter = TokenMinter::new(store.clone(), acquirer, http, &config);
        Harness {
            _dir: dir,
            store,
            driver,
            minter,
        }
    }

    fn token(secret: &str, expires: i64) -> StoredEntry {
        StoredEntry::Token(TokenRecord::new(secret, expires))
    }

    fn far_future() -> i64 {
        now_epoch() + 3600
    }

    fn token_body(access_token: &str) -> String {
        format!(
            r#"{{"token_type":"Bearer","access_token":"{}","expires_in":3600}}"#,
            access_token
        )
    }

    #[tokio::test]
    async fn test_valid_cached_token_makes_no_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/test-tenant/oauth2/v2.0/token")
            .expect(0)
            .create_async()
            .await;

        let h = harness(
            &server.url(),
            vec![(AUTHORIZATION_SCOPE, token("cached", far_future()))],
        );
        let record = h.minter.ensure(&Scope::authorization()).await.unwrap();

        assert_eq!(record.secret, "cached");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_resource_token_is_exchanged_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/test-tenant/oauth2/v2.0/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "rt".into()),
            ]))
            .with_status(200)
            .with_body(token_body("new-agg"))
            .expect(1)
            .create_async()
            .await;

        let h = harness(
            &server.url(),
            vec![
                ("refreshToken", token("rt", far_future())),
                (
                    "https://chatsvcagg.teams.microsoft.com/.default",
                    token("old", now_epoch() - 10),
                ),
            ],
        );

        let first = h.minter.ensure(&Scope::chat_aggregator()).await.unwrap();
        let second = h.minter.ensure(&Scope::chat_aggregator()).await.unwrap();

        assert_eq!(first.secret, "new-agg");
        assert_eq!(second, first);
        assert_eq!(h.driver.launches.load(Ordering::SeqCst), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_refresh_token_triggers_login_first() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/test-tenant/oauth2/v2.0/token")
            .match_body(Matcher::UrlEncoded(
                "refresh_token".into(),
                "fresh-rt".into(),
            ))
            .with_status(200)
            .with_body(token_body("x-token"))
            .create_async()
            .await;

        let h = harness(
            &server.url(),
            vec![("refreshToken", token("stale", now_epoch() - 1))],
        );

        let record = h
            .minter
            .ensure(&Scope::Resource("https://X/.default".to_string()))
            .await
            .unwrap();

        assert_eq!(record.secret, "x-token");
        assert_eq!(h.driver.launches.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.store.get(&Scope::RefreshCredential).await.unwrap().secret,
            "fresh-rt"
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_exchange_leaves_store_unchanged() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/test-tenant/oauth2/v2.0/token")
            .with_status(401)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let expired = now_epoch() - 10;
        let h = harness(
            &server.url(),
            vec![
                ("refreshToken", token("rt", far_future())),
                (AUTHORIZATION_SCOPE, token("old", expired)),
            ],
        );
        let before = h.store.snapshot().await;

        let err = h.minter.ensure(&Scope::authorization()).await.unwrap_err();

        match err {
            BrokerError::TokenExchangeFailed { status, .. } => assert_eq!(status, 401),
            other => panic!("expected exchange failure, got {:?}", other),
        }
        assert_eq!(h.store.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_session_token_chains_through_authorization_scope() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/test-tenant/oauth2/v2.0/token")
            .match_body(Matcher::UrlEncoded(
                "scope".into(),
                format!("{} openid profile offline_access", AUTHORIZATION_SCOPE),
            ))
            .with_status(200)
            .with_body(token_body("authz-bearer"))
            .create_async()
            .await;
        let authz_mock = server
            .mock("POST", "/api/authsvc/v1.0/authz")
            .match_header("authorization", "Bearer authz-bearer")
            .with_status(200)
            .with_body(r#"{"tokens":{"skypeToken":"skype-1","expiresIn":86400}}"#)
            .create_async()
            .await;

        let h = harness(
            &server.url(),
            vec![("refreshToken", token("rt", far_future()))],
        );
        let record = h.minter.ensure(&Scope::SessionToken).await.unwrap();

        assert_eq!(record.secret, "skype-1");
        assert_eq!(
            h.store.get(&Scope::authorization()).await.unwrap().secret,
            "authz-bearer"
        );
        token_mock.assert_async().await;
        authz_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_site_cookie_resolves_site_root_first() {
        let mut server = mockito::Server::new_async().await;
        let web_url = server.url();
        let settings_mock = server
            .mock("POST", "/api/mt/part/emea-02/beta/users/useraggregatesettings")
            .match_header("authorization", "Bearer authz")
            .with_status(200)
            .with_body(format!(
                r#"{{"tenantSiteUrl":{{"value":{{"webUrl":"{}/_layouts/15/sharepoint.aspx"}}}}}}"#,
                web_url
            ))
            .expect(1)
            .create_async()
            .await;
        let site_scope = format!("{}/.default", web_url);
        let token_mock = server
            .mock("POST", "/test-tenant/oauth2/v2.0/token")
            .match_body(Matcher::UrlEncoded(
                "scope".into(),
                format!("{} openid profile offline_access", site_scope),
            ))
            .with_status(200)
            .with_body(token_body("site-bearer"))
            .create_async()
            .await;
        let cookie_mock = server
            .mock("POST", "/sites/Engineering/_api/SP.OAuth.NativeClient/Authenticate")
            .match_header("authorization", "Bearer site-bearer")
            .with_status(200)
            .with_header("set-cookie", "SPOIDCRL=cookie-value; path=/; secure")
            .create_async()
            .await;

        let h = harness(
            &server.url(),
            vec![
                ("refreshToken", token("rt", far_future())),
                (AUTHORIZATION_SCOPE, token("authz", far_future())),
            ],
        );

        let cookie = h.minter.ensure_site_cookie("Engineering").await.unwrap();
        assert_eq!(cookie.secret, "cookie-value");
        assert_eq!(h.store.site_root().await.as_deref(), Some(web_url.as_str()));

        // Cached now: neither the root URL nor the cookie is fetched again
        let again = h.minter.ensure_site_cookie("Engineering").await.unwrap();
        assert_eq!(again, cookie);
        assert_eq!(h.minter.ensure_site_root().await.unwrap(), web_url);

        settings_mock.assert_async().await;
        token_mock.assert_async().await;
        cookie_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_site_root_is_not_a_token_scope() {
        let h = harness("http://127.0.0.1:1", vec![]);
        assert!(h.minter.ensure(&Scope::SiteRoot).await.is_err());
        assert!(h.minter.ensure(&Scope::SiteCookie).await.is_err());
    }

    #[tokio::test]
    async fn test_expiry_skew_refreshes_early() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/test-tenant/oauth2/v2.0/token")
            .with_status(200)
            .with_body(token_body("early"))
            .expect(1)
            .create_async()
            .await;

        let mut h = harness(
            &server.url(),
            vec![
                ("refreshToken", token("rt", far_future())),
                (AUTHORIZATION_SCOPE, token("almost", now_epoch() + 30)),
            ],
        );
        h.minter.expiry_skew = 60;

        let record = h.minter.ensure(&Scope::authorization()).await.unwrap();
        assert_eq!(record.secret, "early");
        mock.assert_async().await;
    }
}
