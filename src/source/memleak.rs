// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! Software source fed by allocation wrappers. Counts bytes allocated and
//! freed per calling context; the difference is exposed as a computed
//! metric.

use std::sync::Arc;

use crate::expr::{BinaryOp, Expr};
use crate::metric::{EventBinding, MetricId, MetricUnit, MetricValue};
use crate::registry::MetricRegistry;
use crate::source::{requested_events, EventInfo, MetricCell, SampleSource, SourceCore, SyncClass};
use crate::store::{CctMetricStore, NodeMetrics};
use crate::thread::{ThreadContext, SENTINEL_EVENT_SET};
use crate::Result;

pub const EVENT: &str = "MEMLEAK";

pub struct MemleakSource {
    core: SourceCore,
    alloc_id: MetricCell,
    free_id: MetricCell,
    leak_id: MetricCell,
}

impl Default for MemleakSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemleakSource {
    pub fn new() -> Self {
        Self {
            core: SourceCore::new("memleak", SyncClass::Software),
            alloc_id: MetricCell::new(),
            free_id: MetricCell::new(),
            leak_id: MetricCell::new(),
        }
    }

    pub fn alloc_id(&self) -> Option<MetricId> {
        self.alloc_id.get()
    }

    pub fn free_id(&self) -> Option<MetricId> {
        self.free_id.get()
    }

    pub fn leak_id(&self) -> Option<MetricId> {
        self.leak_id.get()
    }

    // Sizes beyond i64::MAX cannot come from a successful allocation and are
    // dropped.
    // This function has to be AS-safe
    fn deliver_bytes(
        &self,
        cell: &MetricCell,
        store: &CctMetricStore,
        thread: &ThreadContext,
        node: &NodeMetrics,
        bytes: usize,
    ) -> Result<bool> {
        match (cell.get(), i64::try_from(bytes)) {
            (Some(id), Ok(bytes)) => {
                self.core
                    .deliver(store, thread, node, id, MetricValue::Int(bytes))
            }
            _ => Ok(false),
        }
    }

    // This function has to be AS-safe
    pub fn record_alloc(
        &self,
        store: &CctMetricStore,
        thread: &ThreadContext,
        node: &NodeMetrics,
        bytes: usize,
    ) -> Result<bool> {
        self.deliver_bytes(&self.alloc_id, store, thread, node, bytes)
    }

    // This function has to be AS-safe
    pub fn record_free(
        &self,
        store: &CctMetricStore,
        thread: &ThreadContext,
        node: &NodeMetrics,
        bytes: usize,
    ) -> Result<bool> {
        self.deliver_bytes(&self.free_id, store, thread, node, bytes)
    }
}

impl SampleSource for MemleakSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn events(&self) -> Vec<EventInfo> {
        vec![EventInfo::new(
            EVENT,
            "The number of bytes allocated and freed per dynamic context",
        )]
    }

    fn init(&self) -> Result<()> {
        self.alloc_id.reset();
        self.free_id.reset();
        self.leak_id.reset();
        self.core.init()
    }

    fn process_event_list(&self, spec: &str, registry: &MetricRegistry) -> Result<()> {
        self.core.begin_configure()?;
        requested_events(self, spec)?;
        if self.alloc_id.get().is_some() {
            return Ok(());
        }

        log::debug!("memleak: setting up metrics for allocation wrappers");
        let binding = EventBinding::new(self.core.name(), EVENT, 1);
        let alloc = registry.register_raw("Bytes Allocated", MetricUnit::Events, binding.clone())?;
        let free = registry.register_raw("Bytes Freed", MetricUnit::Events, binding)?;
        let leak = registry.register_computed(
            "Bytes Leaked",
            MetricUnit::Events,
            Expr::binary(BinaryOp::Sub, Expr::leaf(alloc), Expr::leaf(free)),
        )?;

        self.alloc_id.set(alloc);
        self.free_id.set(free);
        self.leak_id.set(leak);
        self.core.mark_configured();
        Ok(())
    }

    // Events are generated by the wrapped allocator, not by a trigger.
    fn gen_event_set(&self, thread: &Arc<ThreadContext>) -> Result<()> {
        self.core.install_event_set(thread, SENTINEL_EVENT_SET)
    }

    fn supports_event(&self, event: &str) -> bool {
        event.contains(EVENT)
    }
}
