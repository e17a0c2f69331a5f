//! MarketGate - Marketplace API access control
//! Mission: Only authenticated, unthrottled callers reach the marketplace

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use marketgate_backend::{
    auth::{
        cookies::CookiePolicy, AccountStore, AuthState, LogNotifier, SessionStore,
        SqliteSessionStore, TokenIssuer,
    },
    build_router, Config, EndpointGuards, RouterConfig,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = Config::parse();
    let secrets = match config.validate() {
        Ok(secrets) => secrets,
        Err(e) => {
            error!("🛑 Refusing to start: {}", e);
            return Err(e).context("Invalid configuration");
        }
    };

    info!("🚀 MarketGate starting");

    let accounts = AccountStore::new(&config.auth_db_path)?;
    let sessions: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(&config.auth_db_path)?);
    let issuer = Arc::new(TokenIssuer::new(
        &secrets.access,
        &secrets.refresh,
        config.access_ttl(),
        config.refresh_ttl(),
    ));

    info!("🔐 Authentication initialized at: {}", config.auth_db_path);

    let state = AuthState::new(
        accounts,
        sessions,
        issuer,
        config.storage_deadline(),
        Arc::new(LogNotifier),
        CookiePolicy {
            secure: config.cookie_secure,
        },
    );

    let guards = EndpointGuards::new(config.block_duration(), config.trusted_proxies.clone());
    let sweepers = guards.spawn_sweepers(config.sweep_period());

    let app = build_router(
        state,
        &guards,
        RouterConfig {
            request_timeout: config.request_timeout(),
            allowed_origins: config.allowed_origins.clone(),
        },
    );

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("🎯 API server listening on {}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    for sweeper in sweepers {
        sweeper.shutdown().await;
    }
    info!("👋 MarketGate stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Initialize tracing with an env-overridable filter
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketgate_backend=debug,marketgate=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also try the crate root when launched from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
