use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use invcache_api::rest::{AppState, create_router};
use invcache_api::{
    Bootstrap, Container, ModelRegistry, ProviderRegistry, Settings, UpstreamFactory,
};

#[derive(Parser)]
#[command(name = "invcache-api")]
#[command(about = "Provider inventory cache - collectors, watches and REST API")]
struct Args {
    /// Listen address for the REST API
    #[arg(short, long, env = "LISTEN", default_value = "[::]:8080")]
    listen: String,

    /// Directory holding one cache file per provider
    #[arg(short, long, env = "DATA_DIR", default_value = "/var/lib/inventory")]
    data_dir: PathBuf,

    /// Seconds between refreshes (0 refreshes only on request)
    #[arg(long, env = "REFRESH_INTERVAL", default_value_t = 300)]
    refresh_interval: u64,

    /// Seconds to wait after a failed load or refresh
    #[arg(long, env = "RETRY_INTERVAL", default_value_t = 5)]
    retry_interval: u64,

    /// Undelivered commit batches a watch may hold before it is dropped
    #[arg(long, env = "WATCH_QUEUE", default_value_t = 250)]
    watch_queue: usize,

    /// JSON file with dynamic types and providers to register at startup
    #[arg(long, env = "PROVIDERS_FILE")]
    providers: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("invcache_api=info".parse()?)
                .add_directive("invcache_store=info".parse()?),
        )
        .init();

    let args = Args::parse();

    tokio::fs::create_dir_all(&args.data_dir).await?;

    let settings = Settings {
        data_dir: args.data_dir.clone(),
        refresh_interval: Duration::from_secs(args.refresh_interval),
        retry_interval: Duration::from_secs(args.retry_interval),
        watch_queue: args.watch_queue.max(1),
    };
    info!(
        "Starting invcache-api - REST: {}, data: {}",
        args.listen,
        settings.data_dir.display()
    );

    let client = reqwest::Client::new();
    let models = Arc::new(ModelRegistry::builtin());
    let providers = Arc::new(ProviderRegistry::new(client.clone()));
    let upstreams = UpstreamFactory::new(client.clone(), providers.clone());
    let container = Arc::new(Container::new(
        settings,
        models.clone(),
        providers.clone(),
        upstreams,
    ));

    if let Some(path) = &args.providers {
        let bootstrap = Bootstrap::load(path)
            .await
            .map_err(|e| format!("Failed to load {}: {}", path.display(), e))?;
        for dynamic in bootstrap.dynamic_types {
            let provider_type = dynamic.provider_type.clone();
            if let Err(e) = providers.register_type(dynamic).await {
                warn!(provider_type = %provider_type, "Skipping dynamic type: {}", e);
            }
        }
        for provider in bootstrap.providers {
            let uid = provider.uid.clone();
            if let Err(e) = container.add(provider).await {
                warn!(uid = %uid, "Skipping provider: {}", e);
            }
        }
    }

    let app_state = Arc::new(AppState {
        container: container.clone(),
        providers,
        models,
        client,
    });
    let router = create_router(app_state);

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!("REST API listening on {}", args.listen);

    // Create shutdown signal channel
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

    let rest_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
            })
            .await
    });

    // Wait for shutdown signal
    let ctrl_c = signal::ctrl_c();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    // Collectors first: ending their watches closes open watch streams so
    // the server can drain.
    info!("Stopping collectors...");
    container.shutdown().await;

    let _ = shutdown_tx.send(true);
    let _ = rest_handle.await;

    info!("Shutdown complete");
    Ok(())
}
