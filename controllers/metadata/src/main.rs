//! Metadata Controller
//!
//! Watches Kubernetes Endpoints and maintains, per node, which services
//! front which pods:
//! - Endpoints changes are queued by `namespace/name` key
//! - Workers reconcile each key into the node's metadata bundle
//! - Bundles live in a TTL cache and are refreshed by periodic resync
//! - An HTTP API serves the services of a pod from that cache

mod api;
mod backoff;
mod bundle;
mod config;
mod controller;
mod error;
mod feed;
mod handlers;
mod listers;
mod mapper;
mod queue;
mod reconciler;
mod worker;

#[cfg(test)]
mod test_utils;

use crate::api::ApiState;
use crate::backoff::ExponentialBackoff;
use crate::bundle::BundleCache;
use crate::config::ControllerConfig;
use crate::controller::{run_cache_janitor, MetadataController};
use crate::error::ControllerError;
use crate::feed::ChangeFeed;
use crate::handlers::EventHandler;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use agent_cache::Cache;
use kube::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    init_tracing();

    // kube's rustls client needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider already installed");
    }

    info!("Starting Metadata Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Workers: {}", config.workers);
    info!("  Max retries: {}", config.max_retries);
    info!("  Cache TTL: {:?}", config.cache_ttl);
    info!("  API address: {}", config.api_addr);
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));

    let client = Client::try_default().await?;
    let cancel = CancellationToken::new();

    let bundles = BundleCache::new(Arc::new(Cache::new()), config.cache_ttl);
    let queue = Arc::new(WorkQueue::new(ExponentialBackoff::new(
        config.backoff_base,
        config.backoff_max,
    )));

    let feed = ChangeFeed::start(
        &client,
        config.namespace.as_deref(),
        EventHandler::new(Arc::clone(&queue)),
        config.resync_period(),
        &cancel,
    );
    let reconciler = Reconciler::new(
        Arc::new(feed.endpoints_store()),
        Arc::new(feed.node_store()),
        bundles.clone(),
    );
    let controller = MetadataController::new(queue, reconciler, &config);

    let api_server = tokio::spawn(api::serve(
        config.api_addr,
        ApiState {
            bundles: bundles.clone(),
            ready: controller.ready_flag(),
        },
        cancel.clone(),
    ));
    let janitor = tokio::spawn(run_cache_janitor(
        Arc::clone(bundles.cache()),
        bundles.ttl(),
        cancel.clone(),
    ));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        shutdown.cancel();
    });

    let result = controller.run(feed.synced(), cancel.clone()).await;
    cancel.cancel();

    feed.join().await;
    if let Err(e) = janitor.await {
        warn!("Cache janitor failed: {}", e);
    }
    match api_server.await {
        Ok(Err(e)) => error!("Metadata API failed: {}", e),
        Err(e) => error!("Metadata API task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Metadata Controller stopped");
    result
}

/// `RUST_LOG` filtering (default `info`), JSON output with `LOG_FORMAT=json`.
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}
