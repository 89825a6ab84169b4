use anyhow::Context;
use clap::Parser;
use core::{future::IntoFuture, time::Duration};
use std::sync::Arc;
use tagsmith_core::{PgRecordStore, RecordStore, SupabaseStorage};
use tagsmith_server::server::{
    api::{AppState, build_router},
    build_pipeline,
    config::{CliArgs, ServerConfig},
    telemetry::init_telemetry,
};
use tokio::{net::TcpListener, signal, sync::watch};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    tokio::fs::create_dir_all(&config.scratch_dir)
        .await
        .with_context(|| format!("failed to create {}", config.scratch_dir.display()))?;

    let store = PgRecordStore::connect(config.database.connect_options(), config.database.pool)
        .await
        .context("failed to connect to Postgres")?;
    if config.bootstrap_schema {
        store
            .ensure_schema()
            .await
            .context("failed to create record tables")?;
    }
    let store = Arc::new(store);

    let client = reqwest::Client::builder()
        .timeout(config.pipeline.stage_timeout)
        .build()
        .context("failed to build HTTP client")?;
    let storage = Arc::new(SupabaseStorage::new(
        client,
        config.supabase_url.clone(),
        config.supabase_key.expose(),
    ));

    let pipeline = Arc::new(build_pipeline(&config, storage, store.clone()));
    let app = build_router(AppState::new(pipeline));

    let listener = TcpListener::bind(config.server_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server_addr))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .into_future();

    tokio::select! {
        result = server => result.context("server error")?,
        () = drain_deadline(shutdown_rx, config.shutdown_timeout) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Drain timeout elapsed, dropping in-flight requests");
        }
    }

    store.close().await;

    #[cfg(feature = "tracing")]
    tracing::info!("Service shut down successfully");

    providers.shutdown();
    Ok(())
}

fn log_startup_info(_config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting tagsmith on {} with full config: {:#?}",
            _config.server_addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting tagsmith on {} (symbology {}, ids {})",
            _config.server_addr,
            _config.symbology,
            _config.id_scheme
        );
    }
}

/// Resolves once `timeout` has passed after shutdown began.
async fn drain_deadline(mut shutdown: watch::Receiver<bool>, timeout: Duration) {
    if shutdown.wait_for(|started| *started).await.is_err() {
        // Sender dropped without signalling; the server future finishes first.
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(timeout).await;
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, draining in-flight requests...");
}
