use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use jellysync_api::{create_router, AppState};
use jellysync_core::{
    bootstrap::{init_database, init_services, load_config},
    logging,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration.
    let config = load_config()?;

    // 2. Initialize logging.
    logging::init_logging(&config.logging)?;
    info!("jellysync starting");
    info!("HTTP address: {}", config.http_address());

    // 3. Open the database and run migrations.
    let pool = init_database(&config).await?;

    // 4. Build the service graph (includes queue crash recovery).
    let config = Arc::new(config);
    let services = Arc::new(init_services(pool.clone(), config.clone()).await?);

    // 5. Seed user mappings from every reachable peer. Non-fatal: mappings
    // also refresh lazily as webhooks arrive.
    if let Err(e) = services.users.sync_all_users().await {
        warn!("user mapping sweep failed: {e}");
    }

    // 6. Start the sync worker.
    services.worker.start();

    // 7. Serve HTTP until SIGTERM / ctrl-c.
    let app = create_router(AppState::new(services.clone()));
    let listener = tokio::net::TcpListener::bind(config.http_address()).await?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 8. Orderly stop: worker first so no new peer calls start, then the
    // store. Anything interrupted mid-flight is recovered at next boot.
    info!("shutting down");
    services.worker.stop().await;
    pool.close().await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install ctrl-c handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}
