//! Worker process entry point.
//!
//! This binary wires up a `Store`, a `QueueManager` over it, and runs the
//! polling loop. It ships with no flow definitions registered — concrete
//! flows are a property of the embedding application, registered through
//! `flowkernel_worker::Worker::run`'s `definitions` map. What's here is the
//! scaffolding: config loading, store selection, logging, and the loop
//! itself.

use std::collections::HashMap;
use std::time::Duration;

use flowkernel_core::config::WorkerConfig;
use flowkernel_core::queue_manager::QueueManager;
use flowkernel_core::store::InMemoryStore;
use flowkernel_worker::output_plugins::OutputPluginHost;
use flowkernel_worker::Worker;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = WorkerConfig::from_env();
    tracing::info!(?config, "flowkernel-worker starting");

    let store = InMemoryStore::new();
    let queue_manager = QueueManager::new(&store);
    let worker = Worker::new(&store, &queue_manager, config);

    let definitions = HashMap::new();
    let plugins = OutputPluginHost::new();

    if let Err(e) = worker.run(definitions, plugins, Duration::from_secs(1)).await {
        tracing::error!(error = %e, "worker loop exited with error");
        std::process::exit(1);
    }
}
