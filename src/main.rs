use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use paygate_api::{
    app_router,
    config::{init_tracing, load_config},
    db, workers, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().context("loading configuration")?;
    init_tracing(config.log_level(), config.log_json);
    info!(
        environment = %config.environment,
        version = env!("CARGO_PKG_VERSION"),
        "starting paygate-api"
    );

    let db = Arc::new(
        db::establish_connection_from_app_config(&config)
            .await
            .context("connecting to database")?,
    );
    if config.auto_migrate {
        db::run_migrations(&db).await.context("running migrations")?;
    }

    let config = Arc::new(config);
    let state = AppState::build(Arc::clone(&db), Arc::clone(&config))?;

    let sweeper = if config.nalogo_enabled {
        Some(workers::ReceiptSweeper::spawn(
            Arc::clone(&state.receipts),
            Duration::from_secs(config.receipt_sweep_interval_secs),
            config.receipt_sweep_batch_limit,
        ))
    } else {
        info!("receipt filing disabled; sweep not started");
        None
    };

    let app = app_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("parsing bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serving")?;

    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await;
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
