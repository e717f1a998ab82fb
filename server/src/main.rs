//! Tandem Server - sync authority for local-first replicas.

use tandem_server::config::Config;
use tandem_server::db::{self, EntryLog};
use tandem_server::{app, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Tandem Server on {}:{}", config.host, config.port);

    let entries = if config.uses_memory() {
        tracing::warn!("DATABASE_URL=memory: entries are lost on restart");
        EntryLog::memory(config.schema())
    } else {
        let pool = db::create_pool(&config.database_url).await?;

        tracing::info!("Running database migrations...");
        db::run_migrations(&pool).await?;
        EntryLog::Postgres(pool)
    };

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config, entries);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        storage = state.entries.kind(),
        strict_schema = state.schema.strict,
        "Server listening on {}",
        addr
    );

    axum::serve(listener, app(state)).await?;

    Ok(())
}
