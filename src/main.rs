use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use compliance_audit::api::{self, AppState};
use compliance_audit::config::AppConfig;
use compliance_audit::database::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "compliance_audit=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting compliance audit ledger");

    // Load configuration
    let config = AppConfig::load()?;
    info!("Configuration loaded");

    // Initialize database
    let database = Database::new(&config.database_url).await?;
    database.run_migrations().await?;
    info!("Database ready");

    let state = AppState::new(config.clone(), database);

    // Verify once at startup so the first summary is served from cache
    let startup = state.integrity.refresh().await?;
    info!("Startup integrity check: {}", startup.summary());

    // Periodic chain-integrity refresh
    state
        .integrity
        .clone()
        .spawn_refresh(config.verification.integrity_refresh_interval());
    info!(
        "Integrity refresh scheduled every {}s",
        config.verification.integrity_refresh_secs
    );

    let app = api::router(state);

    let addr: SocketAddr = config.bind_address().parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
