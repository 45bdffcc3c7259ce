//! The `QueueManager`: durable per-session request/response
//! bookkeeping plus the session notification queue, all built on top of one
//! `Store` and the `Scheduler` from [`crate::scheduler`].
//!
//! Writes go through a buffered `MutationPool` and are only made visible by
//! an explicit [`QueueManager::flush`] — mirroring `FlushMessages()` in the
//! original runner, where only the top-level runner in a parent/child chain
//! ever flushes so a child's writes never become visible before its
//! parent's.

use std::sync::Mutex;

use tracing::debug;

use crate::error::{GrrError, Result};
use crate::identity::{QueueName, SessionId};
use crate::message::{GrrMessage, RequestState};
use crate::scheduler::Scheduler;
use crate::store::{MutationPool, Store};

const REQUEST_PREFIX: &str = "request:";
const RESPONSE_PREFIX: &str = "response:";
const NOTIFICATION_QUEUE: &str = "notifications";

fn request_column(request_id: u64) -> String {
    format!("{REQUEST_PREFIX}{request_id:016x}")
}

fn response_column(request_id: u64, response_id: u64) -> String {
    format!("{RESPONSE_PREFIX}{request_id:016x}:{response_id:016x}")
}

/// One completed request: its durable state plus every response that
/// arrived for it, terminated by a `Status` message.
pub struct CompletedRequest {
    pub request: RequestState,
    pub responses: Vec<GrrMessage>,
}

pub struct QueueManager<'s> {
    store: &'s dyn Store,
    scheduler: Scheduler<'s>,
    pool: Mutex<Box<dyn MutationPool + 's>>,
}

impl<'s> QueueManager<'s> {
    pub fn new(store: &'s dyn Store) -> Self {
        Self {
            store,
            scheduler: Scheduler::new(store),
            pool: Mutex::new(store.mutation_pool()),
        }
    }

    /// Sends a message to a client by scheduling it as a task on the
    /// client's own queue (the `CallClient` path).
    pub fn queue_client_message(
        &self,
        client_queue: QueueName,
        priority: crate::task::Priority,
        payload: Vec<u8>,
    ) -> Result<crate::task::Task> {
        self.scheduler.schedule(client_queue, priority, payload)
    }

    /// Removes a pending outbound task, e.g. when a flow is erroring out and
    /// must stop waiting on work it already dispatched.
    pub fn dequeue_client_request(&self, client_queue: &QueueName, task_id: u64) -> Result<()> {
        self.scheduler.delete(client_queue, task_id)
    }

    pub fn queue_request(&self, request: &RequestState) -> Result<()> {
        let bytes = serde_json::to_vec(request)
            .map_err(|e| GrrError::BadMessage(format!("request serialization: {e}")))?;
        let mut pool = self.pool.lock().expect("mutation pool lock poisoned");
        pool.queue_set(
            request.session_id.as_str(),
            &request_column(request.request_id),
            bytes,
        );
        Ok(())
    }

    pub fn queue_response(&self, message: &GrrMessage) -> Result<()> {
        let bytes = serde_json::to_vec(message)
            .map_err(|e| GrrError::BadMessage(format!("response serialization: {e}")))?;
        let mut pool = self.pool.lock().expect("mutation pool lock poisoned");
        pool.queue_set(
            message.session_id.as_str(),
            &response_column(message.request_id, message.response_id),
            bytes,
        );
        Ok(())
    }

    /// Flushes every request/response write queued so far, making it
    /// visible to other readers of the underlying `Store`.
    pub fn flush(&self) -> Result<()> {
        let mut pool = self.pool.lock().expect("mutation pool lock poisoned");
        let fresh = self.store.mutation_pool();
        let finished = std::mem::replace(&mut *pool, fresh);
        finished.flush()
    }

    fn all_requests(&self, session_id: &SessionId) -> Result<Vec<RequestState>> {
        let cells = self.store.resolve_regex(session_id.as_str(), REQUEST_PREFIX)?;
        let mut out = Vec::with_capacity(cells.len());
        for (_, (bytes, _)) in cells {
            out.push(
                serde_json::from_slice::<RequestState>(&bytes)
                    .map_err(|e| GrrError::BadMessage(format!("request deserialization: {e}")))?,
            );
        }
        out.sort_by_key(|r| r.request_id);
        Ok(out)
    }

    /// All responses for one request, oldest first.
    pub fn fetch_completed_responses(
        &self,
        session_id: &SessionId,
        request_id: u64,
    ) -> Result<Vec<GrrMessage>> {
        let prefix = format!("{RESPONSE_PREFIX}{request_id:016x}:");
        let cells = self.store.resolve_regex(session_id.as_str(), &prefix)?;
        let mut out = Vec::with_capacity(cells.len());
        for (_, (bytes, _)) in cells {
            out.push(
                serde_json::from_slice::<GrrMessage>(&bytes)
                    .map_err(|e| GrrError::BadMessage(format!("response deserialization: {e}")))?,
            );
        }
        out.sort_by_key(|m| m.response_id);
        Ok(out)
    }

    /// Requests whose response set already contains a terminating `Status`
    /// message, in ascending request-id order. Returns at most `limit`
    /// requests plus whether more were available past that page — the
    /// caller is expected to flush and re-drive when `more` is true.
    pub fn fetch_completed_requests(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<(Vec<CompletedRequest>, bool)> {
        let now = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(self.store.now_millis())
            .unwrap_or_else(chrono::Utc::now);
        let requests = self.all_requests(session_id)?;
        let mut completed = Vec::new();
        for request in requests {
            if request.not_before.map(|nb| nb > now).unwrap_or(false) {
                continue;
            }
            let responses = self.fetch_completed_responses(session_id, request.request_id)?;
            if responses.iter().any(|m| m.is_status()) {
                completed.push(CompletedRequest { request, responses });
            }
        }
        let more = completed.len() > limit;
        completed.truncate(limit);
        Ok((completed, more))
    }

    /// Tears down every durable request/response row for a session, e.g.
    /// once a flow terminates and its collections have been finalized.
    pub fn destroy_flow_states(&self, session_id: &SessionId) -> Result<()> {
        let mut columns: Vec<String> = self
            .store
            .resolve_regex(session_id.as_str(), REQUEST_PREFIX)?
            .into_iter()
            .map(|(col, _)| col)
            .collect();
        columns.extend(
            self.store
                .resolve_regex(session_id.as_str(), RESPONSE_PREFIX)?
                .into_iter()
                .map(|(col, _)| col),
        );
        self.store
            .delete_attributes(session_id.as_str(), &columns, None, None)
    }

    /// Schedules a notification that `session_id` has new work to process.
    pub fn queue_notification(&self, session_id: &SessionId) -> Result<()> {
        self.scheduler.schedule(
            QueueName::from(NOTIFICATION_QUEUE),
            crate::task::Priority::Medium,
            session_id.as_str().as_bytes().to_vec(),
        )?;
        debug!(session = %session_id, "queued notification");
        Ok(())
    }

    pub fn delete_notification(&self, task_id: u64) -> Result<()> {
        self.scheduler.delete(&QueueName::from(NOTIFICATION_QUEUE), task_id)
    }

    /// Leases up to `limit` due notifications (oldest first), returning the
    /// session id each one names alongside the task id needed to delete it
    /// once processed.
    pub fn fetch_due_notifications(&self, limit: usize, lease_seconds: i64) -> Result<Vec<(u64, SessionId)>> {
        let tasks = self
            .scheduler
            .query_and_own(&QueueName::from(NOTIFICATION_QUEUE), limit, lease_seconds)?;
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            let session = String::from_utf8(task.payload)
                .map_err(|e| GrrError::BadMessage(format!("notification payload: {e}")))?;
            out.push((task.id, SessionId::from(session)));
        }
        Ok(out)
    }
}
