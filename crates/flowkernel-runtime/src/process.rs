//! `ProcessCompletedRequests`: the worker-loop entry point
//! that walks a flow's completed requests in order and drives its state
//! methods.
//!
//! Requests are consumed strictly in `next_processed_request` order:
//! anything arriving ahead of that cursor is out-of-order and stops the
//! pass (it will be picked up once the gap closes); anything behind it is
//! a stale leftover from a previous pass and is skipped. A request whose
//! response stream has a hole before its terminal `Status` is treated as
//! still in flight and retried up to a fixed budget before the flow is
//! failed outright.

use chrono::Utc;
use flowkernel_core::flow_context::FlowState;
use flowkernel_core::message::GrrMessage;
use flowkernel_core::metrics::Metrics;
use flowkernel_core::store::Store;

use crate::error::Result;
use crate::flow::FlowDefinition;
use crate::runner::FlowRunner;

const PAGE_SIZE: usize = 50;
const MAX_RESPONSE_GAP_RETRIES: u32 = 5;

fn has_response_gap(responses: &[GrrMessage]) -> bool {
    let mut expected = 0u64;
    for r in responses {
        if r.response_id != expected {
            return true;
        }
        expected += 1;
        if r.is_status() {
            break;
        }
    }
    false
}

/// Runs one pass of completed-request processing for `runner`, dispatching
/// into `definition`'s state methods. Re-drives internally when the queue
/// manager reports more completed requests than fit in one page.
pub fn process_completed_requests<'s>(
    runner: &FlowRunner<'s>,
    definition: &FlowDefinition,
    metrics: &Metrics,
) -> Result<()> {
    if runner.context.is_running() {
        if let Some(deadline) = runner.context.kill_timestamp() {
            if Utc::now() >= deadline {
                runner.error(format!("flow killed: no progress since heartbeat deadline {deadline}"));
                metrics.record_flow_error();
            }
        }
    }
    runner.heartbeat();

    loop {
        let (completed, more) = runner
            .queue_manager
            .fetch_completed_requests(runner.session_id(), PAGE_SIZE)?;

        for item in completed {
            if !runner.context.is_running() {
                break;
            }
            let want = runner.context.next_processed_request();
            if item.request.request_id > want {
                metrics.record_out_of_order();
                break;
            }
            if item.request.request_id < want {
                continue;
            }

            if has_response_gap(&item.responses) {
                if item.request.transmission_count >= MAX_RESPONSE_GAP_RETRIES {
                    runner.error(format!(
                        "gave up waiting for request {} after {} retries",
                        item.request.request_id, MAX_RESPONSE_GAP_RETRIES
                    ));
                    metrics.record_flow_error();
                    break;
                }
                let mut retried = item.request.clone();
                retried.transmission_count += 1;
                runner.queue_manager.queue_request(&retried)?;
                metrics.record_retransmission();
                break;
            }

            if let (Some(client_queue), Some(task_id)) =
                (&item.request.client_queue, item.request.client_task_id)
            {
                runner.queue_manager.dequeue_client_request(client_queue, task_id)?;
            }
            if let Some(status) = item.responses.iter().find(|m| m.is_status()) {
                runner.budget.record_usage(status.cpu_used, status.network_bytes_used);
            }

            match definition.handler(&item.request.next_state) {
                Some(handler) => match handler(runner, &item.responses) {
                    Ok(()) => {
                        runner.context.advance_processed_request();
                    }
                    Err(e) => {
                        runner.error(e.to_string());
                        metrics.record_flow_error();
                    }
                },
                None => {
                    runner.error(format!("no such state '{}'", item.request.next_state));
                    metrics.record_flow_error();
                }
            }
        }

        if !more {
            break;
        }
        runner.flush()?;
    }

    if runner.is_top_level() {
        runner.flush()?;
    }
    if matches!(runner.context.state(), FlowState::Terminated) {
        metrics.record_flow_completed();
    }
    Ok(())
}

/// Tears down a terminated or errored flow's durable request/response rows.
/// Called once `ProcessCompletedRequests` observes a terminal state and the
/// output plugin host (one layer up) has finished with the flow's results.
pub fn destroy_flow_states(store: &dyn Store, runner: &FlowRunner<'_>) -> Result<()> {
    let _ = store;
    runner.queue_manager.destroy_flow_states(runner.session_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkernel_core::config::WorkerConfig;
    use flowkernel_core::identity::{QueueName, SessionId};
    use flowkernel_core::queue_manager::QueueManager;
    use flowkernel_core::store::InMemoryStore;
    use flowkernel_core::task::Priority;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_start_state_and_terminates() {
        let store = InMemoryStore::new();
        let qm = QueueManager::new(&store);
        let runner = FlowRunner::new_top_level(
            &store,
            &qm,
            SessionId::from("aff4:/CA/flows/X"),
            60.0,
            1_000_000,
            WorkerConfig::default(),
        );
        let metrics = Metrics::new();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let definition = FlowDefinition::new("Noop").with_state("Start", move |r, _responses| {
            calls2.fetch_add(1, Ordering::SeqCst);
            r.terminate();
            Ok(())
        });

        runner.call_state("Start", None).unwrap();
        qm.flush().unwrap();

        process_completed_requests(&runner, &definition, &metrics).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(runner.context.state(), FlowState::Terminated);
        assert_eq!(metrics.snapshot().flow_completed_count, 1);
    }

    #[test]
    fn out_of_order_response_halts_processing_until_gap_closes() {
        let store = InMemoryStore::new();
        let qm = QueueManager::new(&store);
        let runner = FlowRunner::new_top_level(
            &store,
            &qm,
            SessionId::from("aff4:/CA/flows/X"),
            60.0,
            1_000_000,
            WorkerConfig::default(),
        );
        let metrics = Metrics::new();
        let definition = FlowDefinition::new("Noop").with_state("Next", |r, _responses| {
            r.terminate();
            Ok(())
        });

        // Dispatch two CallClient requests (ids 1 and 2); only the second's
        // response arrives.
        runner
            .call_client(QueueName::from("C.1"), Priority::Medium, "Next", vec![])
            .unwrap();
        runner
            .call_client(QueueName::from("C.1"), Priority::Medium, "Next", vec![])
            .unwrap();
        qm.flush().unwrap();

        qm.queue_response(&GrrMessage {
            session_id: runner.session_id().clone(),
            request_id: 2,
            response_id: 0,
            message_type: flowkernel_core::message::MessageType::Status,
            payload: vec![],
            outcome: Some(flowkernel_core::message::StatusOutcome::Ok),
            cpu_used: 0.0,
            network_bytes_used: 0,
            created_at: chrono::Utc::now(),
        })
        .unwrap();
        qm.flush().unwrap();

        process_completed_requests(&runner, &definition, &metrics).unwrap();
        assert_eq!(metrics.snapshot().response_out_of_order, 1);
        assert!(runner.context.is_running());
    }

    #[test]
    fn gap_is_retried_then_abandoned_after_max_retries() {
        let store = InMemoryStore::new();
        let qm = QueueManager::new(&store);
        let runner = FlowRunner::new_top_level(
            &store,
            &qm,
            SessionId::from("aff4:/CA/flows/X"),
            60.0,
            1_000_000,
            WorkerConfig::default(),
        );
        let metrics = Metrics::new();
        let definition = FlowDefinition::new("Noop").with_state("Next", |r, _responses| {
            r.terminate();
            Ok(())
        });

        runner
            .call_client(QueueName::from("C.1"), Priority::Medium, "Next", vec![])
            .unwrap();
        qm.flush().unwrap();

        // A Status response arrives but response_id 0 never does: a gap.
        qm.queue_response(&GrrMessage {
            session_id: runner.session_id().clone(),
            request_id: 1,
            response_id: 1,
            message_type: flowkernel_core::message::MessageType::Status,
            payload: vec![],
            outcome: Some(flowkernel_core::message::StatusOutcome::Ok),
            cpu_used: 0.0,
            network_bytes_used: 0,
            created_at: chrono::Utc::now(),
        })
        .unwrap();
        qm.flush().unwrap();

        for expected_retries in 1..=MAX_RESPONSE_GAP_RETRIES {
            process_completed_requests(&runner, &definition, &metrics).unwrap();
            assert!(runner.context.is_running());
            assert_eq!(metrics.snapshot().request_retransmission_count, expected_retries as u64);
        }

        // The gap still hasn't closed after the retry budget is spent: the
        // flow gives up.
        process_completed_requests(&runner, &definition, &metrics).unwrap();
        assert_eq!(runner.context.state(), FlowState::Error);
        assert_eq!(metrics.snapshot().flow_errors, 1);
    }
}
