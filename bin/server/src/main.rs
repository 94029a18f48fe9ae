use std::sync::Arc;
use tally_ai::{ChatAgent, OpenAiCompatibleProvider};
use tally_conversation::{FsBlobStore, HttpMediaFetcher, MediaArchiver, SessionStore};
use tally_ledger::Ledger;
use tally_server::{
    config::ServerConfig,
    db::{PgSessionRepository, PgTransactionRepository, UserRepository},
    routes::{self, AppState},
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = ServerConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    // Create database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("failed to run migrations");

    let http = reqwest::Client::new();

    let archiver = MediaArchiver::new(
        Arc::new(HttpMediaFetcher::new(http.clone())),
        Arc::new(FsBlobStore::new(config.media.root.clone())),
        config.media.archiver_config(),
    );
    let sessions = Arc::new(
        SessionStore::new(Arc::new(PgSessionRepository::new(db_pool.clone())))
            .with_media_archiver(archiver),
    );

    let ledger = Ledger::new(Arc::new(PgTransactionRepository::new(db_pool.clone())));
    let provider = Arc::new(OpenAiCompatibleProvider::new(config.provider.clone(), http));
    let agent = ChatAgent::new(provider, Arc::clone(&sessions), tally_tools::finance_registry(ledger))
        .with_config(config.agent.clone());

    let state = Arc::new(AppState::new(agent, UserRepository::new(db_pool)));
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .expect("failed to bind to address");

    tracing::info!("listening on http://{}", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Let in-flight media archiving finish before exiting.
    sessions.drain_background().await;
    tracing::info!("shut down");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
