// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! Software source fed by message-passing wrappers: bytes received, number
//! of receives and cycles spent receiving, per calling context.

use std::sync::Arc;

use crate::metric::{EventBinding, MetricId, MetricUnit, MetricValue};
use crate::registry::MetricRegistry;
use crate::source::{requested_events, EventInfo, MetricCell, SampleSource, SourceCore, SyncClass};
use crate::store::{CctMetricStore, NodeMetrics};
use crate::thread::{ThreadContext, SENTINEL_EVENT_SET};
use crate::Result;

pub const EVENT: &str = "RCCE";

pub struct RcceSource {
    core: SourceCore,
    receive_id: MetricCell,
    receive_freq_id: MetricCell,
    receive_tsc_id: MetricCell,
}

impl Default for RcceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RcceSource {
    pub fn new() -> Self {
        Self {
            core: SourceCore::new("rcce", SyncClass::Software),
            receive_id: MetricCell::new(),
            receive_freq_id: MetricCell::new(),
            receive_tsc_id: MetricCell::new(),
        }
    }

    pub fn receive_id(&self) -> Option<MetricId> {
        self.receive_id.get()
    }

    pub fn receive_freq_id(&self) -> Option<MetricId> {
        self.receive_freq_id.get()
    }

    pub fn receive_tsc_id(&self) -> Option<MetricId> {
        self.receive_tsc_id.get()
    }

    // This function has to be AS-safe
    fn inc(
        &self,
        cell: &MetricCell,
        store: &CctMetricStore,
        thread: &ThreadContext,
        node: Option<&NodeMetrics>,
        incr: i64,
    ) -> Result<bool> {
        match (node, cell.get()) {
            (Some(node), Some(id)) => {
                self.core
                    .deliver(store, thread, node, id, MetricValue::Int(incr))
            }
            _ => Ok(false),
        }
    }

    /// Credits `bytes` received. A missing node (the wrapper could not
    /// unwind) is ignored.
    pub fn receive_inc(
        &self,
        store: &CctMetricStore,
        thread: &ThreadContext,
        node: Option<&NodeMetrics>,
        bytes: i64,
    ) -> Result<bool> {
        self.inc(&self.receive_id, store, thread, node, bytes)
    }

    pub fn receive_freq_inc(
        &self,
        store: &CctMetricStore,
        thread: &ThreadContext,
        node: Option<&NodeMetrics>,
        incr: i64,
    ) -> Result<bool> {
        self.inc(&self.receive_freq_id, store, thread, node, incr)
    }

    pub fn receive_tsc_inc(
        &self,
        store: &CctMetricStore,
        thread: &ThreadContext,
        node: Option<&NodeMetrics>,
        cycles: i64,
    ) -> Result<bool> {
        self.inc(&self.receive_tsc_id, store, thread, node, cycles)
    }
}

impl SampleSource for RcceSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn events(&self) -> Vec<EventInfo> {
        vec![EventInfo::new(
            EVENT,
            "The number of bytes transferred per dynamic context",
        )]
    }

    fn init(&self) -> Result<()> {
        self.receive_id.reset();
        self.receive_freq_id.reset();
        self.receive_tsc_id.reset();
        self.core.init()
    }

    fn process_event_list(&self, spec: &str, registry: &MetricRegistry) -> Result<()> {
        self.core.begin_configure()?;
        let events = requested_events(self, spec)?;
        if self.receive_id.get().is_some() {
            return Ok(());
        }

        log::debug!("rcce: setting up metrics for receive wrapper");
        let event = events[0].name.as_str();
        let binding = EventBinding::new(self.core.name(), event, 1);
        let receive = registry.register_raw("Bytes Received", MetricUnit::Events, binding.clone())?;
        let freq = registry.register_raw("Receive Frequency", MetricUnit::Events, binding.clone())?;
        let tsc = registry.register_raw("CYCLE for Receive", MetricUnit::Events, binding)?;

        self.receive_id.set(receive);
        self.receive_freq_id.set(freq);
        self.receive_tsc_id.set(tsc);
        self.core.mark_configured();
        Ok(())
    }

    fn gen_event_set(&self, thread: &Arc<ThreadContext>) -> Result<()> {
        self.core.install_event_set(thread, SENTINEL_EVENT_SET)
    }

    fn supports_event(&self, event: &str) -> bool {
        event.contains(EVENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn receive_counters() {
        let registry = Arc::new(MetricRegistry::new());
        let store = CctMetricStore::new(registry.clone());
        let source = RcceSource::new();
        source.init().unwrap();
        source.process_event_list("RCCE_RECV", &registry).unwrap();

        let names: Vec<_> = registry.iter().map(|desc| desc.name.clone()).collect();
        assert_eq!(
            names,
            vec!["Bytes Received", "Receive Frequency", "CYCLE for Receive"]
        );

        let thread = ThreadContext::new(3, "rank-0");
        source.thread_init(&thread).unwrap();
        source.gen_event_set(&thread).unwrap();
        source.start(&thread).unwrap();
        assert!(source.is_active(&thread));

        let node = store.new_node();
        source.receive_inc(&store, &thread, Some(&node), 4096).unwrap();
        source.receive_freq_inc(&store, &thread, Some(&node), 1).unwrap();
        source.receive_tsc_inc(&store, &thread, Some(&node), 1200).unwrap();
        source.receive_inc(&store, &thread, Some(&node), 4096).unwrap();
        source.receive_freq_inc(&store, &thread, Some(&node), 1).unwrap();
        assert!(!source.receive_inc(&store, &thread, None, 1).unwrap());

        assert_eq!(
            store.read(&node, source.receive_id().unwrap()).unwrap(),
            MetricValue::Int(8192)
        );
        assert_eq!(
            store.read(&node, source.receive_freq_id().unwrap()).unwrap(),
            MetricValue::Int(2)
        );
        assert_eq!(
            store.read(&node, source.receive_tsc_id().unwrap()).unwrap(),
            MetricValue::Int(1200)
        );

        source.shutdown().unwrap();
        assert!(!source.is_active(&thread));
        assert!(!source.receive_inc(&store, &thread, Some(&node), 1).unwrap());
    }

    #[test]
    fn configure_before_init() {
        let registry = MetricRegistry::new();
        let source = RcceSource::new();
        assert!(matches!(
            source.process_event_list("RCCE", &registry),
            Err(Error::OrderingViolation { .. })
        ));
    }

    #[test]
    fn namespace() {
        let source = RcceSource::new();
        assert!(source.supports_event("RCCE"));
        assert!(source.supports_event("RCCE_SEND"));
        assert!(!source.supports_event("MEMLEAK"));
    }
}
