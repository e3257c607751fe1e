use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod aws;
pub mod config;
pub mod db;
pub mod engine;
pub mod git;
pub mod repository;
pub mod service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "caravel_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Caravel Orchestrator...");

    let config = config::OrchestratorConfig::from_env()?;

    tracing::info!("Connecting to database...");

    // Create database connection pool
    let pool = db::create_pool(&config.database_url).await?;

    tracing::info!("Database connection pool created");

    // Run migrations
    db::run_migrations(&pool).await?;

    // Wire the cloud-facing collaborators
    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .load()
        .await;
    let bind_addr = config.bind_addr.clone();
    let deps = Arc::new(service::Deps::production(config, &sdk_config));

    // Build router with all API endpoints
    let app = api::create_router(pool, deps);

    tracing::info!("Listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    axum::serve(listener, app).await?;

    Ok(())
}
