// Cricket auction server entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file)
// 2. Load config
// 3. Open database
// 4. Import season datasets
// 5. Create the event channel and application state
// 6. Spawn WebSocket server task
// 7. Spawn app logic task
// 8. Wait for Ctrl+C
// 9. Cleanup on exit

use cricket_core::db;
use cricket_server::app;
use cricket_server::config;
use cricket_server::seasons;
use cricket_server::ws_server;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing (log to file)
    init_tracing()?;
    info!("Cricket auction server starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: {}s bid window, purse {} lakhs, default season {}",
        config.auction.bid_window_secs,
        config.auction.initial_purse_lakhs,
        config.scoring.season
    );

    // 3. Open database
    let db = db::Database::open(&config.database.path).context("failed to open database")?;
    info!("Database opened at {}", config.database.path);

    // 4. Import season datasets
    let imported = seasons::import_seasons_dir(&db, &config.data.seasons_dir)
        .context("failed to import season datasets")?;
    if imported.is_empty() {
        warn!("No season datasets imported; set generation will fail until one is added");
    }
    match db.live_room_codes() {
        Ok(codes) if !codes.is_empty() => {
            info!("Resuming timers for {} live room(s)", codes.len())
        }
        Ok(_) => {}
        Err(e) => error!("Failed to list live rooms: {e:#}"),
    }

    // 5. Create the event channel and application state
    let (ws_tx, ws_rx) = mpsc::channel(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listen_addr = config.listen_addr();
    let app_state = app::AppState::new(config, db);

    // 6. Spawn WebSocket server task
    let bind_addr = listen_addr.clone();
    let ws_handle = tokio::spawn(async move {
        match ws_server::TungsteniteListener::bind(&bind_addr).await {
            Ok(listener) => {
                if let Err(e) = ws_server::run(listener, ws_tx).await {
                    error!("WebSocket server error: {}", e);
                }
            }
            Err(e) => {
                error!("Failed to bind WebSocket server on {}: {}", bind_addr, e);
            }
        }
    });

    // 7. Spawn app logic task
    let mut app_handle = tokio::spawn(async move {
        if let Err(e) = app::run(ws_rx, shutdown_rx, app_state).await {
            error!("Application loop error: {}", e);
        }
    });

    info!("Server ready. WebSocket server listening on {}", listen_addr);

    // 8. Wait for Ctrl+C
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    // 9. Cleanup: stop accepting clients, tell the app loop to stop, and
    // abort it if it does not finish in time.
    ws_handle.abort();
    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(std::time::Duration::from_secs(5), &mut app_handle).await {
        Ok(_) => info!("Cricket auction server shut down cleanly"),
        Err(_) => {
            warn!("Application loop did not stop within 5s; aborting");
            app_handle.abort();
        }
    }

    Ok(())
}

/// Initialize tracing to log to `logs/cricket-auction.log`.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("cricket-auction.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cricket_server=info,cricket_core=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
