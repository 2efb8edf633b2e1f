use anyhow::Result;
use std::sync::Arc;

use teams_token_broker::auth::{ChromeLoginDriver, TokenStore};
use teams_token_broker::config::Config;
use teams_token_broker::routes;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("🚀 Teams Token Broker starting...");
    tracing::info!(
        "Server configured: {}:{}",
        config.server_host,
        config.server_port
    );

    if config.init_token_store {
        TokenStore::init_if_missing(&config.token_file).await?;
    }

    // The store is the only state that survives restarts; without it nothing works
    let store = match TokenStore::load(&config.token_file).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("❌ {}", e);
            tracing::error!("");
            tracing::error!("🔧 Create an empty store with:");
            tracing::error!("");
            tracing::error!("      teams-token-broker --init-token-store");
            tracing::error!("");
            anyhow::bail!("Startup failed: {}", e);
        }
    };

    let driver = Arc::new(ChromeLoginDriver::new(
        config.browser_executable.clone(),
        config.browser_profile_dir.clone(),
        config.endpoints.login_page.clone(),
    ));

    let app_state = routes::AppState::build(config.clone(), store, driver)?;
    tracing::info!("✅ Token minter and proxy initialized");

    let app = routes::build_app(app_state);

    // Bind to configured host and port
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    print_startup_banner(&config);

    tracing::info!("🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("👋 Server shutdown complete");

    Ok(())
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    let banner = r#"
╔═══════════════════════════════════════════════════════════╗
║                                                           ║
║                  🔑 Teams Token Broker                    ║
║                                                           ║
║      Token minting and REST proxy for Microsoft Teams     ║
║                                                           ║
╚═══════════════════════════════════════════════════════════╝
"#;

    println!("{}", banner);
    println!("  Version:     {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Server:      http://{}:{}",
        config.server_host, config.server_port
    );
    println!("  Token Store: {}", config.token_file.display());
    println!("  Browser:     {}", config.browser_executable);
    println!("  Login Wait:  {}s", config.login_timeout);
    println!("  Region:      {} ({})", config.endpoints.region, config.endpoints.partition);
    println!("  Log Level:   {}", config.log_level);
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
