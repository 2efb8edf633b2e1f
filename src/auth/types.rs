// Authentication types

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Store key of the renewable credential captured by interactive login
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
/// Store key of the chat service session token
pub const SKYPE_TOKEN_KEY: &str = "skypetoken";
/// Store key of the SharePoint site session cookie
pub const SITE_COOKIE_KEY: &str = "SPOIDCRL";
/// Store key of the cached SharePoint root URL
pub const SITE_ROOT_KEY: &str = "webUrl";

/// Resource scope backing the session token, aggregate settings and pictures
pub const AUTHORIZATION_SCOPE: &str = "https://api.spaces.skype.com/Authorization.ReadWrite";
/// Resource scope of the chat service aggregator (teams, channel messages)
pub const CHATSVCAGG_SCOPE: &str = "https://chatsvcagg.teams.microsoft.com/.default";
/// Resource scope of the IC3 chat service (conversation details)
pub const IC3_SCOPE: &str = "https://ic3.teams.office.com/Teams.AccessAsUser.All";

/// Validity assumed for a freshly captured refresh credential
pub const REFRESH_TOKEN_LIFETIME_SECS: i64 = 86_400;
/// Validity assumed for the site cookie, which reports no expiry (one month)
pub const SITE_COOKIE_LIFETIME_SECS: i64 = 2_628_288;

/// Current wall-clock time in Unix seconds
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Every kind of credential the broker keeps, keyed in the store by [`Scope::key`].
///
/// Dependencies between scopes:
/// - `RefreshCredential` comes only from interactive login
/// - `Resource` tokens are minted from `RefreshCredential`
/// - `SessionToken` and `SiteRoot` need the `Authorization.ReadWrite` resource token
/// - `SiteCookie` needs `SiteRoot` plus the resource token bound to that site
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    RefreshCredential,
    Resource(String),
    SessionToken,
    SiteCookie,
    SiteRoot,
}

impl Scope {
    pub fn authorization() -> Self {
        Scope::Resource(AUTHORIZATION_SCOPE.to_string())
    }

    pub fn chat_aggregator() -> Self {
        Scope::Resource(CHATSVCAGG_SCOPE.to_string())
    }

    pub fn ic3() -> Self {
        Scope::Resource(IC3_SCOPE.to_string())
    }

    /// Resource scope bound to a SharePoint root URL
    pub fn site(web_url: &str) -> Self {
        Scope::Resource(format!("{}/.default", web_url.trim_end_matches('/')))
    }

    /// Key under which the scope is persisted
    pub fn key(&self) -> Cow<'_, str> {
        match self {
            Scope::RefreshCredential => Cow::Borrowed(REFRESH_TOKEN_KEY),
            Scope::Resource(uri) => Cow::Borrowed(uri.as_str()),
            Scope::SessionToken => Cow::Borrowed(SKYPE_TOKEN_KEY),
            Scope::SiteCookie => Cow::Borrowed(SITE_COOKIE_KEY),
            Scope::SiteRoot => Cow::Borrowed(SITE_ROOT_KEY),
        }
    }

    pub fn from_key(key: &str) -> Self {
        match key {
            REFRESH_TOKEN_KEY => Scope::RefreshCredential,
            SKYPE_TOKEN_KEY => Scope::SessionToken,
            SITE_COOKIE_KEY => Scope::SiteCookie,
            SITE_ROOT_KEY => Scope::SiteRoot,
            other => Scope::Resource(other.to_string()),
        }
    }

    /// Scope that must be valid before this one can be minted
    pub fn depends_on(&self) -> Option<Scope> {
        match self {
            Scope::RefreshCredential => None,
            Scope::Resource(_) => Some(Scope::RefreshCredential),
            Scope::SessionToken | Scope::SiteRoot => Some(Scope::authorization()),
            Scope::SiteCookie => Some(Scope::SiteRoot),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// A credential valid until `expires` (Unix seconds). Replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub secret: String,
    pub expires: i64,
}

impl TokenRecord {
    pub fn new(secret: impl Into<String>, expires: i64) -> Self {
        Self {
            secret: secret.into(),
            expires,
        }
    }

    /// Record valid for `lifetime_secs` from now
    pub fn valid_for(secret: impl Into<String>, lifetime_secs: i64) -> Self {
        Self::new(secret, now_epoch() + lifetime_secs)
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires < now
    }
}

/// Value stored under a key: a token record, or the plain site root URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredEntry {
    Token(TokenRecord),
    Url(String),
}

/// Identity provider refresh-token grant response
#[derive(Debug, Deserialize)]
pub struct OAuthTokenResponse {
    pub access_token: String,
    pub expires_in: i64,
}

/// authsvc response carrying the session token
#[derive(Debug, Deserialize)]
pub struct AuthzResponse {
    pub tokens: Option<AuthzTokens>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthzTokens {
    pub skype_token: Option<String>,
    pub expires_in: Option<i64>,
}

/// Entry of the browser's local storage written by the identity library
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCredential {
    pub credential_type: String,
    #[serde(default)]
    pub secret: Option<String>,
}
