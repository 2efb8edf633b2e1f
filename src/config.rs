use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// Public client used by the Teams web app
const DEFAULT_CLIENT_ID: &str = "5e3ce6c0-2b1f-4285-8d4b-75ee78787346";
const DEFAULT_TENANT_ID: &str = "660a30b5-8e2e-4769-b9eb-4af28bfd12bd";

/// Teams Token Broker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value = "5173")]
    pub port: u16,

    /// Path to the persisted token store
    #[arg(short = 't', long, env = "TOKEN_FILE", default_value = "tokens/tokens.json")]
    pub token_file: String,

    /// Create an empty token store if none exists yet
    #[arg(long)]
    pub init_token_store: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Chrome or Chromium executable used for interactive login
    #[arg(short = 'b', long, env = "BROWSER_EXECUTABLE", default_value = "chromium")]
    pub browser: String,

    /// Browser profile directory kept between logins
    #[arg(long, env = "BROWSER_PROFILE_DIR", default_value = "./microsoft-auth-env")]
    pub browser_profile: String,

    /// Seconds to wait for the user to finish logging in
    #[arg(long, env = "LOGIN_TIMEOUT", default_value = "600")]
    pub login_timeout: u64,

    /// Browser origins allowed to read API responses (comma separated, `*` for any)
    #[arg(
        long,
        env = "CORS_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:5173,http://127.0.0.1:5173"
    )]
    pub cors_origins: Vec<String>,
}

/// Remote base URLs, overridable so tests can point them at a mock server
#[derive(Clone, Debug)]
pub struct Endpoints {
    /// Identity provider host (token endpoint lives under the tenant)
    pub login_base: String,
    /// Teams web host (authsvc, chatsvc, csa, mt)
    pub teams_base: String,
    /// Async media gateway (inline images)
    pub asyncgw_base: String,
    /// Page opened in the login browser
    pub login_page: String,
    /// Regional segment of chatsvc/csa paths
    pub region: String,
    /// Partition segment of mt paths
    pub partition: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login_base: "https://login.microsoftonline.com".to_string(),
            teams_base: "https://teams.microsoft.com".to_string(),
            asyncgw_base: "https://eu-prod.asyncgw.teams.microsoft.com".to_string(),
            login_page: "https://teams.microsoft.com".to_string(),
            region: "emea".to_string(),
            partition: "emea-02".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,
    pub cors_origins: Vec<String>,

    // Token store
    pub token_file: PathBuf,
    pub init_token_store: bool,

    // Identity provider
    pub client_id: String,
    pub tenant_id: String,
    pub token_expiry_skew: u64,

    // Interactive login
    pub browser_executable: String,
    pub browser_profile_dir: PathBuf,
    pub login_timeout: u64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    pub endpoints: Endpoints,

    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let defaults = Endpoints::default();

        let config = Config {
            server_host: args.host,
            server_port: args.port,
            cors_origins: args.cors_origins,

            token_file: expand_tilde(&args.token_file),
            init_token_store: args.init_token_store,

            client_id: env_or("CLIENT_ID", DEFAULT_CLIENT_ID),
            tenant_id: env_or("TENANT_ID", DEFAULT_TENANT_ID),
            token_expiry_skew: env_parse("TOKEN_EXPIRY_SKEW", 60),

            browser_executable: args.browser,
            browser_profile_dir: expand_tilde(&args.browser_profile),
            login_timeout: args.login_timeout,

            http_connect_timeout: env_parse("HTTP_CONNECT_TIMEOUT", 30),
            http_request_timeout: env_parse("HTTP_REQUEST_TIMEOUT", 120),

            endpoints: Endpoints {
                login_base: env_or("LOGIN_BASE_URL", &defaults.login_base),
                teams_base: env_or("TEAMS_BASE_URL", &defaults.teams_base),
                asyncgw_base: env_or("ASYNCGW_BASE_URL", &defaults.asyncgw_base),
                login_page: env_or("LOGIN_PAGE_URL", &defaults.login_page),
                region: env_or("TEAMS_REGION", &defaults.region),
                partition: env_or("TEAMS_PARTITION", &defaults.partition),
            },

            log_level: args.log_level,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.login_timeout == 0 {
            anyhow::bail!("LOGIN_TIMEOUT must be greater than zero");
        }

        let bases = [
            ("LOGIN_BASE_URL", &self.endpoints.login_base),
            ("TEAMS_BASE_URL", &self.endpoints.teams_base),
            ("ASYNCGW_BASE_URL", &self.endpoints.asyncgw_base),
        ];
        for (name, value) in bases {
            if value.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
            reqwest::Url::parse(value).with_context(|| format!("{} is not a valid URL", name))?;
        }

        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

impl Config {
    /// Configuration with every remote host pointed at `base_url` (tests, local mocks)
    pub fn for_testing(base_url: &str, token_file: PathBuf) -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            cors_origins: vec!["http://localhost:5173".to_string()],
            token_file,
            init_token_store: false,
            client_id: "test-client-id".to_string(),
            tenant_id: "test-tenant".to_string(),
            token_expiry_skew: 0,
            browser_executable: "chromium".to_string(),
            browser_profile_dir: PathBuf::from("/tmp/test-profile"),
            login_timeout: 5,
            http_connect_timeout: 5,
            http_request_timeout: 10,
            endpoints: Endpoints {
                login_base: base_url.to_string(),
                teams_base: base_url.to_string(),
                asyncgw_base: base_url.to_string(),
                login_page: base_url.to_string(),
                region: "emea".to_string(),
                partition: "emea-02".to_string(),
            },
            log_level: "debug".to_string(),
        }
    }
}
