use std::env;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod config;
mod controller;
mod error;
mod observed_config;
mod observer;
mod operator_config;
mod queue;
mod rate_limiter;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting kube-config-observer {}", env!("CARGO_PKG_VERSION"));

    let settings = match env::var("CONFIG_FILE") {
        Ok(path) => config::load_settings(path)?,
        Err(_) => config::Settings::default(),
    };

    let client = controller::create_client().await?;
    let observer = Arc::new(controller::ConfigObserver::from_client(
        client.clone(),
        &settings,
    ));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
                return;
            }
            info!("Received shutdown signal");
            shutdown.cancel();
        });
    }

    let watches = tokio::spawn(controller::watch_sources(
        client,
        settings.namespace.clone(),
        observer.event_bridge(),
        shutdown.clone(),
    ));

    let port = settings.webserver.port;
    tokio::spawn(async move {
        if let Err(e) = webserver::serve(port).await {
            error!("Webserver failed: {e:?}");
        }
    });

    observer.run(1, shutdown).await;
    watches.await?;

    Ok(())
}
