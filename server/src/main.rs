use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use server::api::{create_router, AppState};
use server::cleanup::CleanupEngine;
use server::config::Config;
use server::events::EventBroadcaster;
use server::repository::{InMemoryPointRepository, PointRepository};
use server::restricted::RestrictedSquareCalculator;
use server::tile_store::TileService;
use shared::geometry::SlopeRegistry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Main-method of the application.
/// Parses command-line arguments, restores the snapshot, then runs the HTTP server and the cleanup sweep.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let repository = match &config.snapshot {
        Some(path) if path.exists() => InMemoryPointRepository::load_snapshot(path).await?,
        _ => InMemoryPointRepository::new(),
    };
    let repository = Arc::new(repository);
    let points: Arc<dyn PointRepository> = repository.clone();

    let tiles = Arc::new(TileService::new(config.tile_cache()));
    let events = Arc::new(EventBroadcaster::new());
    let registry = Arc::new(RwLock::new(SlopeRegistry::new()));

    let engine = Arc::new(CleanupEngine::new(
        Arc::clone(&points),
        Arc::clone(&tiles),
        Arc::clone(&events),
        Arc::clone(&registry),
        config.cleanup(),
    ));
    let cleanup_handle = engine.spawn();

    let app = create_router(AppState {
        points,
        tiles,
        events,
        restricted: Arc::new(RestrictedSquareCalculator::new()),
        registry,
        reset_threshold: config.reset_threshold,
    });

    let address = config.bind_address();
    let listener = TcpListener::bind(&address).await?;
    info!("Grid world server listening on {}", address);
    let server_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    // Handle shutdown gracefully
    tokio::select! {
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("HTTP server stopped: {}", e),
                Err(e) => error!("HTTP server task panicked: {}", e),
                Ok(Ok(())) => warn!("HTTP server exited"),
            }
        }
        result = cleanup_handle => {
            if let Err(e) = result {
                error!("Cleanup task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    if let Some(path) = &config.snapshot {
        repository.save_snapshot(path).await?;
    }

    Ok(())
}
