use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod access;
mod api;
mod bounds;
mod caching;
mod config;
mod error;
mod persistence;
mod realtime;
mod state;
mod static_data;
mod store;

use access::ApiKeys;
use caching::CacheControl;
use config::Cli;
use persistence::{load_overlay, save_overlay};
use state::DataManager;
use static_data::StaticLoader;

const PERSIST_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn")),
        )
        .init();

    let cli = Cli::parse();
    let dump_config = cli.dump_config;
    let config = match cli.resolve() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    if dump_config {
        println!(
            "{}",
            serde_json::to_string_pretty(&config.to_json_config().redacted())?
        );
        return Ok(());
    }

    // 1. Initialize State
    info!(env = ?config.env, port = config.port, "starting");
    let manager = Arc::new(DataManager::new());
    let cancel = CancellationToken::new();
    let data_dir = config.data_dir();

    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                signal.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
        }
    });

    // 2. Restore realtime overlay
    if let Err(e) = load_overlay(&manager, &data_dir) {
        warn!(error = %e, "failed to restore realtime overlay");
    }

    // 3. Static data: initial load, then background refresh
    let loader = Arc::new(StaticLoader::new(config.static_feed.clone(), config.db.clone()));
    match loader.clone().refresh(manager.clone(), &cancel).await {
        Ok(version) => {
            if let Some(snapshot) = manager.current() {
                info!(version, bounds = ?snapshot.region_bounds(), "initial static GTFS load complete");
            }
        }
        Err(e) => warn!(error = %e, "initial static GTFS load failed, background updater will retry"),
    }
    let mut tasks: Vec<JoinHandle<()>> = vec![loader.start_updater(
        manager.clone(),
        config.static_refresh_interval(),
        cancel.child_token(),
    )];

    // 4. Realtime pollers
    let feeds: Vec<_> = config.realtime_feeds.iter().cloned().map(Arc::new).collect();
    let client = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()?;
    tasks.extend(realtime::spawn_pollers(&feeds, client, manager.clone(), &cancel));

    // 5. Persistence loop
    tasks.push(spawn_persistence(manager.clone(), data_dir.clone(), cancel.child_token()));

    // 6. HTTP Server
    let keys = Arc::new(ApiKeys::new(
        &config.api_keys,
        &config.exempt_api_keys,
        config.rate_limit,
    ));
    let routes = api::routes(manager.clone(), CacheControl::new(config.cache_max_age), keys);
    let shutdown = cancel.clone();
    let (addr, server) = warp::serve(routes).try_bind_with_graceful_shutdown(
        ([0, 0, 0, 0], config.port),
        async move { shutdown.cancelled().await },
    )?;
    info!(%addr, "server running");
    let server = tokio::spawn(server);

    cancel.cancelled().await;

    if let Err(e) = server.await {
        error!(error = %e, "server task failed");
    }
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "background task failed");
        }
    }

    match save_overlay(&manager, &data_dir) {
        Ok(files) => info!(files, "saved realtime overlay"),
        Err(e) => error!(error = %e, "failed to save realtime overlay"),
    }
    info!("stopped");
    Ok(())
}

fn spawn_persistence(
    manager: Arc<DataManager>,
    data_dir: impl AsRef<Path> + Send + 'static,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(PERSIST_INTERVAL) => {}
            }
            let (manager, dir) = (manager.clone(), data_dir.as_ref().to_path_buf());
            let saved = tokio::task::spawn_blocking(move || save_overlay(&manager, &dir)).await;
            match saved {
                Ok(Ok(files)) => info!(files, "saved realtime overlay"),
                Ok(Err(e)) => error!(error = %e, "error saving realtime overlay"),
                Err(e) => error!(error = %e, "persistence task failed"),
            }
        }
    })
}
