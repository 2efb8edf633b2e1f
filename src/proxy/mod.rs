//! Resource proxy
//!
//! One method per remote Teams/SharePoint call. Each resolves the
//! credential it needs through the [`TokenMinter`], attaches it in the style
//! the endpoint expects and hands back the JSON or raw bytes of a 200 reply.

use anyhow::Context;
use bytes::Bytes;
use reqwest::{header, RequestBuilder, Response, StatusCode, Url};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::{post_aggregate_settings, Scope, TokenMinter};
use crate::config::Endpoints;
use crate::error::{BrokerError, Result};
use crate::http_client::{endpoint_url, BrokerHttpClient};

const TEAMS_ORIGIN: &str = "https://teams.microsoft.com";
/// User id the web client addresses team pictures through
const TEAM_PICTURE_USER_ID: &str = "15de4241-e9be-4910-a60f-3f37dd8652b8";
const PROFILE_PICTURE_SIZE: &str = "HR64x64";
const CHANNEL_PAGE_SIZE: &str = "20";
const LIST_RENDER_OPTIONS: u64 = 5_723_911;

/// How a credential is attached to an outbound request
enum Credential {
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// `Authentication: skypetoken=<token>` (chat service)
    SkypeAuthentication(String),
    /// `Authorization: skype_token <token>` (media gateway)
    SkypeAuthorization(String),
    /// `authtoken` cookie plus a Referer (picture endpoints)
    AuthCookie { bearer: String, referer: &'static str },
    /// `SPOIDCRL` cookie (SharePoint)
    SiteCookie(String),
}

impl Credential {
    fn apply(self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Credential::Bearer(token) => request.bearer_auth(token),
            Credential::SkypeAuthentication(token) => {
                request.header("Authentication", format!("skypetoken={}", token))
            }
            Credential::SkypeAuthorization(token) => {
                request.header(header::AUTHORIZATION, format!("skype_token {}", token))
            }
            Credential::AuthCookie { bearer, referer } => request
                .header(
                    header::COOKIE,
                    format!("authtoken=Bearer={}&Origin={};", bearer, TEAMS_ORIGIN),
                )
                .header(header::REFERER, referer),
            Credential::SiteCookie(cookie) => {
                request.header(header::COOKIE, format!("SPOIDCRL={}", cookie))
            }
        }
    }
}

pub struct TeamsProxy {
    minter: Arc<TokenMinter>,
    http: BrokerHttpClient,
    endpoints: Endpoints,
}

impl TeamsProxy {
    pub fn new(minter: Arc<TokenMinter>, http: BrokerHttpClient, endpoints: Endpoints) -> Self {
        Self {
            minter,
            http,
            endpoints,
        }
    }

    fn teams_url(&self, segments: &[&str]) -> Result<Url> {
        endpoint_url(&self.endpoints.teams_base, segments)
    }

    async fn token(&self, scope: &Scope) -> Result<String> {
        Ok(self.minter.ensure(scope).await?.secret)
    }

    /// Send with the credential attached; anything but 200 is an upstream error
    async fn fetch(&self, request: RequestBuilder, credential: Credential) -> Result<Response> {
        let response = self.http.send(credential.apply(request)).await?;

        let status = response.status();
        if status != StatusCode::OK {
            let url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = status.as_u16(),
                url = %url,
                body = %body,
                "Upstream call failed"
            );
            return Err(BrokerError::UpstreamError {
                status: status.as_u16(),
                url,
            });
        }
        Ok(response)
    }

    async fn fetch_json(&self, request: RequestBuilder, credential: Credential) -> Result<Value> {
        let response = self.fetch(request, credential).await?;
        let data: Value = response
            .json()
            .await
            .context("Failed to parse upstream JSON")?;
        Ok(data)
    }

    async fn fetch_bytes(&self, request: RequestBuilder, credential: Credential) -> Result<Bytes> {
        let response = self.fetch(request, credential).await?;
        let data = response
            .bytes()
            .await
            .context("Failed to read upstream body")?;
        Ok(data)
    }

    /// Own chat service profile properties
    pub async fn user_properties(&self) -> Result<Value> {
        let token = self.token(&Scope::SessionToken).await?;
        let url = self.teams_url(&[
            "api",
            "chatsvc",
            self.endpoints.region.as_str(),
            "v1",
            "users",
            "ME",
            "properties",
        ])?;
        self.fetch_json(
            self.http.client().get(url),
            Credential::SkypeAuthentication(token),
        )
        .await
    }

    /// Teams and channels the user is a member of
    pub async fn user_teams(&self) -> Result<Value> {
        let token = self.token(&Scope::chat_aggregator()).await?;
        let url = self.teams_url(&[
            "api",
            "csa",
            self.endpoints.region.as_str(),
            "api",
            "v2",
            "teams",
            "users",
            "me",
        ])?;
        let request = self.http.client().get(url).query(&[
            ("isPrefetch", "false"),
            ("enableMembershipSummary", "true"),
            ("enableRC2Fetch", "false"),
        ]);
        self.fetch_json(request, Credential::Bearer(token)).await
    }

    /// First page of a channel's messages
    pub async fn team_conversation(&self, team_id: &str, topic_id: &str) -> Result<Value> {
        let token = self.token(&Scope::chat_aggregator()).await?;
        let url = self.teams_url(&[
            "api",
            "csa",
            self.endpoints.region.as_str(),
            "api",
            "v2",
            "teams",
            team_id,
            "channels",
            topic_id,
        ])?;
        let request = self
            .http
            .client()
            .get(url)
            .query(&[("filterSystemMessage", "true"), ("pageSize", CHANNEL_PAGE_SIZE)]);
        self.fetch_json(request, Credential::Bearer(token)).await
    }

    pub async fn team_details(&self, conversation_id: &str) -> Result<Value> {
        let token = self.token(&Scope::ic3()).await?;
        let url = self.teams_url(&[
            "api",
            "chatsvc",
            self.endpoints.region.as_str(),
            "v1",
            "users",
            "ME",
            "conversations",
            conversation_id,
        ])?;
        let request = self
            .http
            .client()
            .get(url)
            .query(&[("view", "msnp24Equivalent")]);
        self.fetch_json(request, Credential::Bearer(token)).await
    }

    /// Inline image stored on the media gateway
    pub async fn image(&self, image_id: &str) -> Result<Bytes> {
        let token = self.token(&Scope::SessionToken).await?;
        let url = endpoint_url(
            &self.endpoints.asyncgw_base,
            &["v1", "objects", image_id, "views", "imgo"],
        )?;
        let request = self.http.client().get(url).query(&[("v", "1")]);
        self.fetch_bytes(request, Credential::SkypeAuthorization(token))
            .await
    }

    pub async fn profile_picture(&self, user_id: &str, display_name: &str) -> Result<Bytes> {
        let bearer = self.token(&Scope::authorization()).await?;
        let url = self.teams_url(&[
            "api",
            "mt",
            "part",
            self.endpoints.partition.as_str(),
            "beta",
            "users",
            user_id,
            "profilepicturev2",
        ])?;
        let request = self
            .http
            .client()
            .get(url)
            .query(&[("displayname", display_name), ("size", PROFILE_PICTURE_SIZE)]);
        self.fetch_bytes(
            request,
            Credential::AuthCookie {
                bearer,
                referer: "https://teams.microsoft.com/_",
            },
        )
        .await
    }

    pub async fn team_picture(
        &self,
        group_id: &str,
        etag: &str,
        display_name: &str,
    ) -> Result<Bytes> {
        let bearer = self.token(&Scope::authorization()).await?;
        let url = self.teams_url(&[
            "api",
            "mt",
            "part",
            self.endpoints.partition.as_str(),
            "beta",
            "users",
            TEAM_PICTURE_USER_ID,
            "profilepicturev2",
            "teams",
            group_id,
        ])?;
        let request = self
            .http
            .client()
            .get(url)
            .query(&[("etag", etag), ("displayName", display_name)]);
        self.fetch_bytes(
            request,
            Credential::AuthCookie {
                bearer,
                referer: "https://teams.microsoft.com/v2/",
            },
        )
        .await
    }

    /// Post arbitrary settings selectors and return the aggregated answer
    pub async fn user_aggregate_settings(&self, body: &Value) -> Result<Value> {
        let bearer = self.token(&Scope::authorization()).await?;
        let response = post_aggregate_settings(&self.http, &self.endpoints, &bearer, body).await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(BrokerError::UpstreamError {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        let data: Value = response
            .json()
            .await
            .context("Failed to parse aggregate settings")?;
        Ok(data)
    }

    /// SharePoint document library folder rendered as list data
    pub async fn render_list_data_as_stream(
        &self,
        section: &str,
        files_relative_path: &str,
    ) -> Result<Value> {
        let cookie = self.minter.ensure_site_cookie(section).await?;
        let web_url = self.minter.ensure_site_root().await?;

        let mut url = endpoint_url(
            &web_url,
            &[
                "sites",
                section,
                "_api",
                "web",
                "GetListUsingPath(DecodedUrl=@a1)",
                "RenderListDataAsStream",
            ],
        )?;
        let path = escape_query_value(files_relative_path);
        url.set_query(Some(&format!(
            "@a1={}&RootFolder={}&TryNewExperienceSingle=TRUE",
            odata_string_literal(&path),
            path
        )));
        let body = json!({
            "parameters": {
                "RenderOptions": LIST_RENDER_OPTIONS,
                "AllowMultipleValueFilterForTaxonomyFields": true,
                "AddRequiredFields": true,
                "ModernListBoot": true,
                "RequireFolderColoringFields": true,
            }
        });

        let request = self
            .http
            .client()
            .post(url)
            .header(header::ACCEPT, "application/json")
            .json(&body);
        self.fetch_json(request, Credential::SiteCookie(cookie.secret))
            .await
    }
}

/// Escape the characters that would otherwise end a query value early.
/// Everything else is percent-encoded when the URL is parsed.
fn escape_query_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '&' => escaped.push_str("%26"),
            '#' => escaped.push_str("%23"),
            '+' => escaped.push_str("%2B"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Quote a value as an OData string literal, doubling embedded quotes
fn odata_string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
