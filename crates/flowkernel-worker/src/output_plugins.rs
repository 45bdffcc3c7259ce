//! Output plugin host: fans a flow's collected results out
//! to zero or more registered sinks once the flow has new replies to
//! publish, isolating a plugin's own failure from the flow's.
//!
//! A plugin failing never fails the flow — it is recorded as an error
//! record in the flow's plugin log and the next plugin still runs.

use flowkernel_core::collections::Collection;
use flowkernel_core::identity::SessionId;
use flowkernel_core::store::Store;
use flowkernel_runtime::error::Result;
use tracing::warn;

/// A sink a flow's results can be forwarded to (a CSV export, an external
/// queue, a BigQuery-style append, ...). Implementations own their own
/// state; the host only calls `process_responses` then `flush` per batch.
pub trait OutputPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn process_responses(&mut self, payloads: &[Vec<u8>]) -> Result<()>;
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct OutputPluginHost {
    plugins: Vec<Box<dyn OutputPlugin>>,
}

impl OutputPluginHost {
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    pub fn register(&mut self, plugin: Box<dyn OutputPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Runs every registered plugin over the flow's current result
    /// collection. Safe to call repeatedly — a well-behaved plugin should
    /// be idempotent over results it has already seen.
    pub fn run_for_flow(&mut self, store: &dyn Store, session_id: &SessionId) -> Result<()> {
        if self.plugins.is_empty() {
            return Ok(());
        }
        let results = Collection::new(store, session_id.as_str(), "result:").scan(None)?;
        let payloads: Vec<Vec<u8>> = results.into_iter().map(|(_, payload)| payload).collect();
        let log = Collection::new(store, session_id.as_str(), "plugin_log:");

        for plugin in &mut self.plugins {
            let outcome = plugin.process_responses(&payloads).and_then(|()| plugin.flush());
            match outcome {
                Ok(()) => {
                    log.add(format!("{}: ok", plugin.name()).into_bytes(), Some("success"))?;
                }
                Err(e) => {
                    warn!(plugin = plugin.name(), session = %session_id, error = %e, "output plugin failed");
                    log.add(format!("{}: {}", plugin.name(), e).into_bytes(), Some("error"))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkernel_core::collections::Collection as Col;
    use flowkernel_core::store::InMemoryStore;
    use flowkernel_runtime::error::GrrError;

    struct CountingPlugin {
        seen: usize,
    }
    impl OutputPlugin for CountingPlugin {
        fn name(&self) -> &str {
            "counting"
        }
        fn process_responses(&mut self, payloads: &[Vec<u8>]) -> Result<()> {
            self.seen += payloads.len();
            Ok(())
        }
    }

    struct FailingPlugin;
    impl OutputPlugin for FailingPlugin {
        fn name(&self) -> &str {
            "failing"
        }
        fn process_responses(&mut self, _payloads: &[Vec<u8>]) -> Result<()> {
            Err(GrrError::TransientStore("sink unreachable".into()))
        }
    }

    #[test]
    fn plugin_failure_is_isolated_and_logged() {
        let store = InMemoryStore::new();
        let session = SessionId::from("aff4:/CA/flows/X");
        Col::new(&store, session.as_str(), "result:").add(b"r1".to_vec(), None).unwrap();

        let mut host = OutputPluginHost::new();
        host.register(Box::new(FailingPlugin));
        host.register(Box::new(CountingPlugin { seen: 0 }));
        host.run_for_flow(&store, &session).unwrap();

        let log = Col::new(&store, session.as_str(), "plugin_log:");
        let errors = log.scan(Some("error")).unwrap();
        let successes = log.scan(Some("success")).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(successes.len(), 1);
    }
}
