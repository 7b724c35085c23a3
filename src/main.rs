use crate::cache::LookupCache;
use crate::cluster::KubePodLister;
use crate::config::Config;
use crate::image_reference::ImageReferenceParser;
use crate::oci_registry::{DockerHub, RegistryClient};
use crate::state::AppState;
use anyhow::Context;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod cache;
mod cluster;
mod config;
mod dashboard;
mod image_reference;
mod oci_registry;
mod secret_string;
mod state;
mod tag_filter;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting kverso {}", env!("CARGO_PKG_VERSION"));

    let config = match env::var("CONFIG_PATH") {
        Ok(path) => config::load_config(path)?,
        Err(_) => {
            info!("CONFIG_PATH is not set, using default configuration");
            Config::default()
        }
    };

    let kube_client = cluster::create_client()
        .await
        .context("Failed to create Kubernetes client")?;

    let docker_hub = DockerHub::from_config(&config.registry.docker_hub)?;
    let registry = RegistryClient::new(
        oci_registry::create_client(&config)?,
        Arc::new(LookupCache::default()),
        docker_hub.clone(),
    );
    let parser = ImageReferenceParser::new(docker_hub.registry_url);

    let shutdown = CancellationToken::new();
    let state = AppState::new(
        KubePodLister::new(kube_client),
        registry,
        parser,
        shutdown.clone(),
    )?;

    let app = webserver::create_app(state);
    let addr = SocketAddr::new(config.webserver.bind_address, config.webserver.port);
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind webserver to {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("Webserver stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM and cancels all in-flight registry lookups.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, cancelling in-flight lookups");
    shutdown.cancel();
}
