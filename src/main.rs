use clap::Parser;
use sprint_reports::api::AppState;
use sprint_reports::config::Args;
use sprint_reports::services::TrackerClient;
use sprint_reports::{build_engine, db, server};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sprint_reports={},info", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let db_path = db::get_db_path(&args.data_dir);
    let pool = db::initialize(&db_path).await?;
    log::info!("Database ready at {}", db_path.display());

    let client = Arc::new(TrackerClient::new(args.client_config()));
    let engine = build_engine(pool, client.clone());

    if let Some(name) = &args.bootstrap_admin {
        let admin = engine.registry().ensure_admin(name).await?;
        log::info!("Admin user: {} (id {})", admin.display_name, admin.id);
    }

    for tracker in engine.registry().list_trackers(true).await? {
        // A tracker with a bad token must not keep the others offline
        if let Err(e) = client.register(&tracker) {
            log::warn!("Tracker {} ({}) not connected: {}", tracker.id, tracker.name, e);
        }
    }

    let cancel_token = CancellationToken::new();
    let state = AppState {
        engine: Arc::new(engine),
    };
    let handle = server::start(args.listen, state, cancel_token).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown signal received");
    handle.shutdown().await;

    Ok(())
}
