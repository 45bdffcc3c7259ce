//! The async worker loop: drains due session notifications
//! oldest-first, drives each flow's completed requests, and hands finished
//! results to the output plugin host.
//!
//! Everything below this module is synchronous; `tokio` only shows up here,
//! at the polling boundary.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use flowkernel_core::config::WorkerConfig;
use flowkernel_core::flow_context::FlowState;
use flowkernel_core::metrics::Metrics;
use flowkernel_core::queue_manager::QueueManager;
use flowkernel_core::store::Store;
use flowkernel_runtime::error::Result;
use flowkernel_runtime::process::process_completed_requests;
use flowkernel_runtime::runner::FlowRunner;
use flowkernel_runtime::FlowDefinition;
use tracing::{info, warn};

use crate::output_plugins::OutputPluginHost;

const NOTIFICATION_BATCH: usize = 16;
const DEFAULT_CPU_SECONDS: f64 = 60.0;
const DEFAULT_NETWORK_BYTES: u64 = 10 * 1024 * 1024;

pub struct Worker<'s> {
    store: &'s dyn Store,
    queue_manager: &'s QueueManager<'s>,
    config: WorkerConfig,
    metrics: Metrics,
}

impl<'s> Worker<'s> {
    pub fn new(store: &'s dyn Store, queue_manager: &'s QueueManager<'s>, config: WorkerConfig) -> Self {
        Self {
            store,
            queue_manager,
            config,
            metrics: Metrics::new(),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Drains whatever notifications are currently due, processing at most
    /// `NOTIFICATION_BATCH` flows. Returns how many were processed.
    pub async fn poll_once(
        &self,
        definitions: &HashMap<String, FlowDefinition>,
        plugins: &mut OutputPluginHost,
    ) -> Result<usize> {
        let lease_seconds = self.config.notification_retry_interval.num_seconds().max(1);
        let due = self
            .queue_manager
            .fetch_due_notifications(NOTIFICATION_BATCH, lease_seconds)?;

        let mut processed = 0;
        for (task_id, session_id) in due {
            let Some(definition) = definitions.get(session_id.queue()) else {
                warn!(queue = session_id.queue(), "no flow registered for queue, dropping notification");
                self.queue_manager.delete_notification(task_id)?;
                continue;
            };

            let runner = FlowRunner::new_top_level(
                self.store,
                self.queue_manager,
                session_id.clone(),
                DEFAULT_CPU_SECONDS,
                DEFAULT_NETWORK_BYTES,
                self.config.clone(),
            );

            match process_completed_requests(&runner, definition, &self.metrics) {
                Ok(()) => {
                    processed += 1;
                    if matches!(runner.context.state(), FlowState::Terminated | FlowState::Error) {
                        self.queue_manager.delete_notification(task_id)?;
                        plugins.run_for_flow(self.store, &session_id)?;
                        flowkernel_runtime::process::destroy_flow_states(self.store, &runner)?;
                    }
                    // Still running with outstanding work: leave the
                    // notification's lease to expire so the next due pass
                    // re-delivers it instead of requeuing it by hand.
                }
                Err(e) => {
                    // Processing this pass failed (e.g. a transient store
                    // error). Leave the notification's lease to expire so
                    // another poll picks it back up instead of dropping it.
                    warn!(session = %session_id, error = %e, "flow processing pass failed, will retry");
                }
            }
        }
        Ok(processed)
    }

    /// Runs [`Self::poll_once`] forever, sleeping `poll_interval` between
    /// empty passes.
    pub async fn run(
        &self,
        definitions: HashMap<String, FlowDefinition>,
        mut plugins: OutputPluginHost,
        poll_interval: StdDuration,
    ) -> Result<()> {
        info!(flows = definitions.len(), "worker loop starting");
        loop {
            let processed = self.poll_once(&definitions, &mut plugins).await?;
            if processed == 0 {
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}
