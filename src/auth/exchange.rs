// Remote exchange protocols: refresh-token grant, session token, site root and site cookie

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{header, StatusCode};
use serde_json::{json, Value};

use super::types::{
    now_epoch, AuthzResponse, OAuthTokenResponse, Scope, TokenRecord, SITE_COOKIE_LIFETIME_SECS,
};
use crate::config::Endpoints;
use crate::error::{BrokerError, Result};
use crate::http_client::{endpoint_url, BrokerHttpClient};

const TEAMS_ORIGIN: &str = "https://teams.microsoft.com";
const SHAREPOINT_LAYOUT_SUFFIX: &str = "/_layouts/15/sharepoint.aspx";
const CLIENT_CLAIMS: &str = r#"{"access_token":{"xms_cc":{"values":["CP1"]}}}"#;

static SITE_COOKIE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"SPOIDCRL=(.+?);").unwrap());

/// Identity provider client settings used for the refresh-token grant
#[derive(Clone, Debug)]
pub struct IdentityClient {
    pub client_id: String,
    pub tenant_id: String,
}

fn token_url(endpoints: &Endpoints, identity: &IdentityClient) -> String {
    format!(
        "{}/{}/oauth2/v2.0/token",
        endpoints.login_base.trim_end_matches('/'),
        identity.tenant_id
    )
}

fn authz_url(endpoints: &Endpoints) -> String {
    format!(
        "{}/api/authsvc/v1.0/authz",
        endpoints.teams_base.trim_end_matches('/')
    )
}

fn aggregate_settings_url(endpoints: &Endpoints) -> String {
    format!(
        "{}/api/mt/part/{}/beta/users/useraggregatesettings",
        endpoints.teams_base.trim_end_matches('/'),
        endpoints.partition
    )
}

fn site_authenticate_url(web_url: &str, section: &str) -> Result<reqwest::Url> {
    endpoint_url(
        web_url,
        &["sites", section, "_api", "SP.OAuth.NativeClient", "Authenticate"],
    )
}

fn exchange_failed(scope: &Scope, status: StatusCode) -> BrokerError {
    BrokerError::TokenExchangeFailed {
        scope: scope.key().into_owned(),
        status: status.as_u16(),
    }
}

/// Log the rejection body and turn the status into an exchange failure
async fn reject(scope: &Scope, response: reqwest::Response) -> BrokerError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    tracing::error!(
        scope = %scope,
        status = status.as_u16(),
        body = %body,
        "Token exchange rejected"
    );
    exchange_failed(scope, status)
}

/// Refresh-token grant for an OAuth resource scope
pub async fn refresh_resource_token(
    http: &BrokerHttpClient,
    endpoints: &Endpoints,
    identity: &IdentityClient,
    refresh_secret: &str,
    scope: &Scope,
) -> Result<TokenRecord> {
    let uri = scope.key();
    tracing::info!("Refreshing token for scope {}", uri);

    let requested = format!("{} openid profile offline_access", uri);
    let form = [
        ("client_id", identity.client_id.as_str()),
        ("scope", requested.as_str()),
        ("grant_type", "refresh_token"),
        ("client_info", "1"),
        ("x-client-SKU", "msal.js.browser"),
        ("x-client-VER", "3.7.1"),
        ("refresh_token", refresh_secret),
        ("claims", CLIENT_CLAIMS),
    ];

    let request = http
        .client()
        .post(token_url(endpoints, identity))
        .header(header::ORIGIN, TEAMS_ORIGIN)
        .form(&form);
    let response = http.send(request).await?;

    if response.status() != StatusCode::OK {
        return Err(reject(scope, response).await);
    }

    let status = response.status();
    let data: OAuthTokenResponse = response.json().await.map_err(|e| {
        tracing::error!(scope = %scope, error = %e, "Malformed token response");
        exchange_failed(scope, status)
    })?;

    let record = TokenRecord::new(data.access_token, now_epoch() + data.expires_in);
    tracing::info!(scope = %scope, expires = record.expires, "Token refreshed");
    Ok(record)
}

/// Exchange the `Authorization.ReadWrite` bearer for a chat service session token
pub async fn exchange_skype_token(
    http: &BrokerHttpClient,
    endpoints: &Endpoints,
    authorization_bearer: &str,
) -> Result<TokenRecord> {
    let scope = Scope::SessionToken;
    tracing::info!("Exchanging bearer token for session token");

    let request = http
        .client()
        .post(authz_url(endpoints))
        .bearer_auth(authorization_bearer)
        .header(header::CONTENT_LENGTH, "0");
    let response = http.send(request).await?;

    let status = response.status();
    if status != StatusCode::OK {
        return Err(reject(&scope, response).await);
    }

    let authz: AuthzResponse = response.json().await.map_err(|e| {
        tracing::error!(error = %e, "Malformed authsvc response");
        exchange_failed(&scope, status)
    })?;

    let (secret, expires_in) = match authz.tokens {
        Some(tokens) => match (tokens.skype_token, tokens.expires_in) {
            (Some(secret), Some(expires_in)) => (secret, expires_in),
            _ => {
                tracing::error!("authsvc response missing skypeToken or expiresIn");
                return Err(exchange_failed(&scope, status));
            }
        },
        None => {
            tracing::error!("authsvc response missing 'tokens' field");
            return Err(exchange_failed(&scope, status));
        }
    };

    Ok(TokenRecord::new(secret, now_epoch() + expires_in))
}

/// POST to the aggregate user settings endpoint.
/// Callers decide how a non-200 is classified.
pub async fn post_aggregate_settings(
    http: &BrokerHttpClient,
    endpoints: &Endpoints,
    authorization_bearer: &str,
    body: &Value,
) -> Result<reqwest::Response> {
    let request = http
        .client()
        .post(aggregate_settings_url(endpoints))
        .bearer_auth(authorization_bearer)
        .json(body);
    http.send(request).await
}

/// Resolve the SharePoint root URL through the tenant site setting
pub async fn resolve_site_root(
    http: &BrokerHttpClient,
    endpoints: &Endpoints,
    authorization_bearer: &str,
) -> Result<String> {
    let scope = Scope::SiteRoot;
    tracing::info!("Resolving SharePoint root URL");

    let response = post_aggregate_settings(
        http,
        endpoints,
        authorization_bearer,
        &json!({ "tenantSiteUrl": true }),
    )
    .await?;

    let status = response.status();
    if status != StatusCode::OK {
        return Err(reject(&scope, response).await);
    }

    let settings: Value = response.json().await.map_err(|e| {
        tracing::error!(error = %e, "Malformed aggregate settings response");
        exchange_failed(&scope, status)
    })?;

    let web_url = settings
        .pointer("/tenantSiteUrl/value/webUrl")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            tracing::error!("Aggregate settings carry no tenantSiteUrl.value.webUrl");
            exchange_failed(&scope, status)
        })?;

    Ok(strip_sharepoint_suffix(web_url))
}

fn strip_sharepoint_suffix(web_url: &str) -> String {
    web_url.replace(SHAREPOINT_LAYOUT_SUFFIX, "")
}

/// Pull the site cookie value out of the response's Set-Cookie headers
fn extract_site_cookie(headers: &header::HeaderMap) -> Option<String> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| {
            SITE_COOKIE_PATTERN
                .captures(value)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
        })
}

/// Authenticate against a site with the site-bound bearer and capture the session cookie
pub async fn exchange_site_cookie(
    http: &BrokerHttpClient,
    web_url: &str,
    section: &str,
    site_bearer: &str,
) -> Result<TokenRecord> {
    let scope = Scope::SiteCookie;
    tracing::info!(section = %section, "Requesting SharePoint site cookie");

    let request = http
        .client()
        .post(site_authenticate_url(web_url, section)?)
        .bearer_auth(site_bearer)
        .header(header::CONTENT_LENGTH, "0");
    let response = http.send(request).await?;

    let status = response.status();
    if status != StatusCode::OK {
        return Err(reject(&scope, response).await);
    }

    let cookie = extract_site_cookie(response.headers()).ok_or_else(|| {
        tracing::error!("Site authentication returned no SPOIDCRL cookie");
        exchange_failed(&scope, status)
    })?;

    Ok(TokenRecord::valid_for(cookie, SITE_COOKIE_LIFETIME_SECS))
}
