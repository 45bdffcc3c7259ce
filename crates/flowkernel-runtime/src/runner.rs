//! `FlowRunner`: the operations a running flow's state
//! methods call to talk to clients, to chain into its own later states, to
//! spawn child flows, and to terminate.
//!
//! A parent and its children share one [`QueueManager`] so that writes
//! queued by a child are only made visible when the top-level runner
//! flushes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use flowkernel_core::config::WorkerConfig;
use flowkernel_core::flow_context::FlowContext;
use flowkernel_core::identity::{QueueName, SessionId};
use flowkernel_core::message::{GrrMessage, MessageType, RequestState, StatusOutcome};
use flowkernel_core::queue_manager::QueueManager;
use flowkernel_core::store::Store;
use flowkernel_core::task::Priority;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GrrError, Result};
use crate::resources::ResourceBudget;

/// What a client worker receives when a flow calls out to it: enough to
/// find its way back to the right request once the client replies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub session_id: SessionId,
    pub request_id: u64,
    pub payload: Vec<u8>,
}

pub struct FlowRunner<'s> {
    pub(crate) queue_manager: &'s QueueManager<'s>,
    store: &'s dyn Store,
    pub context: FlowContext,
    is_top_level: bool,
    pub(crate) budget: ResourceBudget,
    config: WorkerConfig,
    replies_sent: AtomicU32,
    notified: Mutex<bool>,
}

impl<'s> FlowRunner<'s> {
    pub fn new_top_level(
        store: &'s dyn Store,
        queue_manager: &'s QueueManager<'s>,
        session_id: SessionId,
        cpu_seconds: f64,
        network_bytes: u64,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue_manager,
            store,
            context: FlowContext::new(session_id, None, Utc::now()),
            is_top_level: true,
            budget: ResourceBudget::new(cpu_seconds, network_bytes),
            config,
            replies_sent: AtomicU32::new(0),
            notified: Mutex::new(false),
        }
    }

    fn new_child(
        store: &'s dyn Store,
        queue_manager: &'s QueueManager<'s>,
        session_id: SessionId,
        creator: SessionId,
        cpu_seconds: f64,
        network_bytes: u64,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue_manager,
            store,
            context: FlowContext::new(session_id, Some(creator), Utc::now()),
            is_top_level: false,
            budget: ResourceBudget::new(cpu_seconds, network_bytes),
            config,
            replies_sent: AtomicU32::new(0),
            notified: Mutex::new(false),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.context.session_id
    }

    /// Sends a message to a client, returning the request id the eventual
    /// response will carry. Fails with `LimitExceeded` if the flow has
    /// already burned through its CPU or network budget.
    pub fn call_client(
        &self,
        client_queue: QueueName,
        priority: Priority,
        next_state: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<u64> {
        if !self.context.is_running() {
            return Err(GrrError::Unauthorized("flow is not running".into()));
        }
        let (cpu_limit, network_bytes_limit) = self.budget.check_and_reserve()?;
        let request_id = self.context.next_outbound_id();

        let envelope = CallEnvelope {
            session_id: self.context.session_id.clone(),
            request_id,
            payload,
        };
        let envelope_bytes = serde_json::to_vec(&envelope)
            .map_err(|e| GrrError::BadMessage(format!("call envelope: {e}")))?;

        let client_task = self
            .queue_manager
            .queue_client_message(client_queue.clone(), priority, envelope_bytes)?;
        self.queue_manager.queue_request(&RequestState {
            session_id: self.context.session_id.clone(),
            request_id,
            next_state: next_state.into(),
            cpu_limit,
            network_bytes_limit,
            transmission_count: 0,
            client_queue: Some(client_queue),
            client_task_id: Some(client_task.id),
            not_before: None,
            created_at: Utc::now(),
        })?;
        debug!(session = %self.context.session_id, request_id, "CallClient dispatched");
        Ok(request_id)
    }

    /// Schedules an immediate (or delayed) transition into one of this
    /// flow's own states, without involving a client.
    pub fn call_state(&self, next_state: impl Into<String>, start_time: Option<DateTime<Utc>>) -> Result<u64> {
        if !self.context.is_running() {
            return Err(GrrError::Unauthorized("flow is not running".into()));
        }
        let request_id = self.context.next_outbound_id();
        self.queue_manager.queue_request(&RequestState {
            session_id: self.context.session_id.clone(),
            request_id,
            next_state: next_state.into(),
            cpu_limit: self.budget.remaining_cpu(),
            network_bytes_limit: self.budget.remaining_network_bytes(),
            transmission_count: 0,
            client_queue: None,
            client_task_id: None,
            not_before: start_time,
            created_at: Utc::now(),
        })?;
        self.queue_manager.queue_response(&GrrMessage {
            session_id: self.context.session_id.clone(),
            request_id,
            response_id: 0,
            message_type: MessageType::Status,
            payload: Vec::new(),
            outcome: Some(StatusOutcome::Ok),
            cpu_used: 0.0,
            network_bytes_used: 0,
            created_at: Utc::now(),
        })?;
        Ok(request_id)
    }

    /// Spawns and immediately runs a child flow's `Start` state, sharing
    /// this runner's queue manager so the child's writes flush only when
    /// the top-level runner does.
    pub fn call_flow(
        &self,
        definition: &crate::flow::FlowDefinition,
        cpu_seconds: f64,
        network_bytes: u64,
    ) -> Result<SessionId> {
        let mut nonce_bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = hex_encode(&nonce_bytes);
        let child_id = SessionId::new(self.context.session_id.queue(), None, &nonce);

        let child = FlowRunner::new_child(
            self.store,
            self.queue_manager,
            child_id.clone(),
            self.context.session_id.clone(),
            cpu_seconds.min(self.budget.remaining_cpu()),
            network_bytes.min(self.budget.remaining_network_bytes()),
            self.config.clone(),
        );
        if let Some(start) = definition.handler("Start") {
            if let Err(e) = start(&child, &[]) {
                warn!(child = %child_id, error = %e, "child flow Start state failed");
                child.context.error(e.to_string());
            }
        }
        Ok(child_id)
    }

    /// Appends one result to the flow's reply collection. A flow spawned by
    /// `call_flow` has no caller waiting on a synchronous return value, so
    /// its replies are delivered into its creator's collection instead of
    /// its own — a top-level flow (no creator) keeps its own.
    pub fn send_reply(&self, payload: Vec<u8>, type_tag: Option<&str>) -> Result<u64> {
        let subject = self.context.creator.as_ref().unwrap_or(&self.context.session_id);
        let col = flowkernel_core::collections::Collection::new(self.store, subject.as_str(), "result:");
        let seq = col.add(payload, type_tag)?;
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
        Ok(seq)
    }

    pub fn log(&self, message: impl Into<String>) -> Result<()> {
        let col = flowkernel_core::collections::Collection::new(self.store, self.context.session_id.as_str(), "log:");
        col.add(message.into().into_bytes(), None)?;
        Ok(())
    }

    /// Alias for [`Self::log`]: `Status()` is just `Log()` under another name.
    pub fn status(&self, message: impl Into<String>) -> Result<()> {
        self.log(message)
    }

    /// Notifies the flow's creator/owner exactly once per flow lifetime.
    pub fn notify(&self) -> Result<()> {
        let mut notified = self.notified.lock().expect("notified lock poisoned");
        if *notified {
            return Ok(());
        }
        *notified = true;
        self.queue_manager.queue_notification(&self.context.session_id)
    }

    pub fn heartbeat(&self) {
        let deadline = Utc::now() + self.config.stuck_flows_timeout;
        self.context.extend_kill_timestamp(deadline);
    }

    pub fn terminate(&self) {
        self.context.terminate();
    }

    pub fn error(&self, message: impl Into<String>) {
        self.context.error(message.into());
    }

    pub fn is_top_level(&self) -> bool {
        self.is_top_level
    }

    /// Makes every request/response queued by this runner (and any child
    /// sharing its queue manager) visible. Only meaningful when called on
    /// the top-level runner; callers are expected to check
    /// [`Self::is_top_level`] themselves before calling this.
    pub fn flush(&self) -> Result<()> {
        self.queue_manager.flush()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
