use axum::{
    extract::{FromRequest, FromRequestParts, Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{
    types::now_epoch, CredentialAcquirer, LoginDriver, StoredEntry, TokenMinter, TokenStore,
};
use crate::config::Config;
use crate::error::BrokerError;
use crate::http_client::BrokerHttpClient;
use crate::middleware;
use crate::proxy::TeamsProxy;

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `Json` whose rejection answers like every other broker error
#[derive(FromRequest)]
#[from_request(via(Json), rejection(BrokerError))]
struct ApiJson<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(Path), rejection(BrokerError))]
struct ApiPath<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(BrokerError))]
struct ApiQuery<T>(T);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<TeamsProxy>,
    pub store: Arc<TokenStore>,
    pub acquirer: Arc<CredentialAcquirer>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the store, login driver, minter and proxy together
    pub fn build(
        config: Config,
        store: Arc<TokenStore>,
        driver: Arc<dyn LoginDriver>,
    ) -> anyhow::Result<Self> {
        let http = BrokerHttpClient::new(config.http_connect_timeout, config.http_request_timeout)?;
        let acquirer = Arc::new(CredentialAcquirer::new(
            store.clone(),
            driver,
            Duration::from_secs(config.login_timeout),
            config.token_expiry_skew as i64,
        ));
        let minter = Arc::new(TokenMinter::new(
            store.clone(),
            acquirer.clone(),
            http.clone(),
            &config,
        ));
        let proxy = Arc::new(TeamsProxy::new(minter, http, config.endpoints.clone()));

        Ok(Self {
            proxy,
            store,
            acquirer,
            config: Arc::new(config),
        })
    }
}

/// Build the application with all routes and middleware
pub fn build_app(state: AppState) -> Router {
    let cors = middleware::cors_layer(&state.config.cors_origins);
    Router::new()
        .merge(health_routes())
        .merge(api_routes(state))
        .layer(axum::middleware::from_fn(middleware::request_log_middleware))
        .layer(cors)
        .layer(middleware::trace_layer())
}

/// Health check routes
pub fn health_routes() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
}

/// Teams proxy routes
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/userProperties", get(user_properties_handler))
        .route("/api/userTeams", get(user_teams_handler))
        .route("/api/image/:image_id", get(image_handler))
        .route(
            "/api/profilePicture/:user_id/:display_name",
            get(profile_picture_handler),
        )
        .route(
            "/api/teamPicture/:group_id/:etag/:display_name",
            get(team_picture_handler),
        )
        .route(
            "/api/teamConversation/:team_id/:topic_id",
            get(team_conversation_handler),
        )
        .route("/api/teamDetails/:team_id", get(team_details_handler))
        .route(
            "/api/renderListDataAsStream/:section",
            get(render_list_data_as_stream_handler),
        )
        .route(
            "/api/userAggregateSettings",
            post(user_aggregate_settings_handler),
        )
        .with_state(state)
}

/// GET / - Simple health check
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Teams Token Broker is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

/// GET /api/status - Stored scopes with their expiry, never the secrets
async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    let now = now_epoch();
    let scopes: Map<String, Value> = state
        .store
        .snapshot()
        .await
        .into_iter()
        .map(|(key, entry)| {
            let summary = match entry {
                StoredEntry::Token(record) => json!({
                    "expires": record.expires,
                    "expired": record.is_expired_at(now),
                }),
                StoredEntry::Url(url) => json!({ "value": url }),
            };
            (key, summary)
        })
        .collect();

    Json(json!({
        "acquirer": state.acquirer.state(),
        "scopes": scopes,
    }))
}

fn jpeg(data: Bytes) -> Response {
    ([(header::CONTENT_TYPE, "image/jpeg")], data).into_response()
}

async fn user_properties_handler(
    State(state): State<AppState>,
) -> Result<Json<Value>, BrokerError> {
    Ok(Json(state.proxy.user_properties().await?))
}

async fn user_teams_handler(State(state): State<AppState>) -> Result<Json<Value>, BrokerError> {
    Ok(Json(state.proxy.user_teams().await?))
}

async fn image_handler(
    State(state): State<AppState>,
    ApiPath(image_id): ApiPath<String>,
) -> Result<Response, BrokerError> {
    Ok(jpeg(state.proxy.image(&image_id).await?))
}

async fn profile_picture_handler(
    State(state): State<AppState>,
    ApiPath((user_id, display_name)): ApiPath<(String, String)>,
) -> Result<Response, BrokerError> {
    Ok(jpeg(
        state
            .proxy
            .profile_picture(&user_id, &display_name)
            .await?,
    ))
}

async fn team_picture_handler(
    State(state): State<AppState>,
    ApiPath((group_id, etag, display_name)): ApiPath<(String, String, String)>,
) -> Result<Response, BrokerError> {
    Ok(jpeg(
        state
            .proxy
            .team_picture(&group_id, &etag, &display_name)
            .await?,
    ))
}

async fn team_conversation_handler(
    State(state): State<AppState>,
    ApiPath((team_id, topic_id)): ApiPath<(String, String)>,
) -> Result<Json<Value>, BrokerError> {
    Ok(Json(
        state.proxy.team_conversation(&team_id, &topic_id).await?,
    ))
}

async fn team_details_handler(
    State(state): State<AppState>,
    ApiPath(team_id): ApiPath<String>,
) -> Result<Json<Value>, BrokerError> {
    Ok(Json(state.proxy.team_details(&team_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDataQuery {
    files_relative_path: Option<String>,
}

async fn render_list_data_as_stream_handler(
    State(state): State<AppState>,
    ApiPath(section): ApiPath<String>,
    ApiQuery(query): ApiQuery<ListDataQuery>,
) -> Result<Json<Value>, BrokerError> {
    let path = query
        .files_relative_path
        .ok_or(BrokerError::MissingParameter("filesRelativePath"))?;
    Ok(Json(
        state
            .proxy
            .render_list_data_as_stream(&section, &path)
            .await?,
    ))
}

async fn user_aggregate_settings_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<Value>,
) -> Result<Json<Value>, BrokerError> {
    Ok(Json(state.proxy.user_aggregate_settings(&body).await?))
}
