//! baas - bcrypt as a service
//!
//! A TCP service that runs password hash/verify operations on a pool of
//! worker threads.

use baas_server::{
    create_tls_acceptor, run_metrics_server, BcryptHasher, Config, Metrics, Server, ServerConfig,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Defaults, then the file named by BAAS_CONFIG, then BAAS_* overrides
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Ok(path) = std::env::var("BAAS_CONFIG") {
        tracing::info!("Loaded config from {}", path);
    }

    let mut server_config = ServerConfig::from_config(&config);

    tracing::info!("Starting baas server");
    tracing::info!("  Bind address: {}", server_config.bind_addr);
    tracing::info!(
        "  Workers: {}",
        config
            .workers
            .count
            .unwrap_or_else(baas_server::default_worker_count)
    );
    match config.workers.max_queue_length {
        Some(max) => tracing::info!("  Max queue length: {}", max),
        None => tracing::info!("  Max queue length: unbounded"),
    }
    tracing::info!("  bcrypt cost: {}", config.workers.bcrypt_cost);
    match server_config.socket_timeout {
        Some(timeout) => tracing::info!("  Socket timeout: {}ms", timeout.as_millis()),
        None => tracing::info!("  Socket timeout: disabled"),
    }

    if config.tls.enabled {
        let acceptor = create_tls_acceptor(&config.tls)?;
        tracing::info!("  TLS: enabled");
        server_config = server_config.with_tls(acceptor);
    } else {
        tracing::info!("  TLS: disabled");
    }

    let (metrics_shutdown, _) = broadcast::channel::<()>(1);
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());

        let addr = config.metrics.bind_addr;
        let shutdown_rx = metrics_shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown_rx).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let hasher = Arc::new(BcryptHasher::new(config.workers.bcrypt_cost));
    let server = Arc::new(Server::new(server_config, hasher));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    let result = server.run().await;

    let _ = metrics_shutdown.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    result?;
    tracing::info!("Server stopped");
    Ok(())
}
