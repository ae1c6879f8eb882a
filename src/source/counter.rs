// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! Hardware-class source on top of an external counter library. The
//! library programs the counters and reports overflows; this source owns
//! the mapping from counter index to metric.

use std::sync::Arc;

use spin::RwLock;

use crate::metric::{EventBinding, MetricId, MetricUnit, MetricValue};
use crate::registry::MetricRegistry;
use crate::source::{requested_events, EventInfo, SampleSource, SourceCore, SyncClass};
use crate::store::{CctMetricStore, NodeMetrics};
use crate::thread::ThreadContext;
use crate::{Error, Result, MAX_METRICS};

/// Events per overflow when the event item carries no `@period`.
pub const DEFAULT_PERIOD: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterEvent {
    pub name: String,
    pub period: u64,
    pub counter: u32,
}

/// Binding to a hardware counter library.
pub trait CounterBackend: Send + Sync {
    /// Events the library can count.
    fn catalog(&self) -> Vec<EventInfo>;

    /// Programs `events` for `thread` and returns the library's handle for
    /// the resulting event set.
    fn program(&self, thread: &ThreadContext, events: &[CounterEvent]) -> Result<u64>;

    fn release(&self, thread: &ThreadContext, event_set: u64) -> Result<()>;
}

pub struct CounterSource<B: CounterBackend> {
    core: SourceCore,
    backend: B,
    events: RwLock<Vec<(CounterEvent, MetricId)>>,
}

impl<B: CounterBackend> CounterSource<B> {
    pub fn new(name: &'static str, backend: B) -> Self {
        Self {
            core: SourceCore::new(name, SyncClass::Hardware),
            backend,
            events: RwLock::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn metric_for(&self, counter: u32) -> Option<MetricId> {
        self.events
            .read()
            .iter()
            .find(|(event, _)| event.counter == counter)
            .map(|(_, id)| *id)
    }

    /// Overflow of `counter` on `thread`: credits one period of events.
    // This function has to be AS-safe
    pub fn on_overflow(
        &self,
        store: &CctMetricStore,
        thread: &ThreadContext,
        node: &NodeMetrics,
        counter: u32,
    ) -> Result<bool> {
        let events = match self.events.try_read() {
            Some(events) => events,
            None => return Ok(false),
        };

        match events.iter().find(|(event, _)| event.counter == counter) {
            Some((event, id)) => {
                self.core
                    .deliver(store, thread, node, *id, MetricValue::Int(event.period as i64))
            }
            None => Ok(false),
        }
    }
}

impl<B: CounterBackend> SampleSource for CounterSource<B> {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn events(&self) -> Vec<EventInfo> {
        self.backend.catalog()
    }

    fn init(&self) -> Result<()> {
        self.events.write().clear();
        self.core.init()
    }

    fn process_event_list(&self, spec: &str, registry: &MetricRegistry) -> Result<()> {
        self.core.begin_configure()?;
        let requested = requested_events(self, spec)?;

        // Registrations cannot be undone, so make sure all of them fit
        // before making the first one.
        let free = MAX_METRICS - registry.len();
        if requested.len() > free {
            return Err(Error::RegistryFull(MAX_METRICS));
        }

        let mut events = self.events.write();
        let mut added = Vec::with_capacity(requested.len());
        for spec in requested {
            let counter = (events.len() + added.len()) as u32;
            let period = spec.period_or(DEFAULT_PERIOD);
            let binding =
                EventBinding::new(self.core.name(), spec.name.as_str(), period).with_counter(counter);
            let id = registry.register_raw(&spec.name, MetricUnit::Events, binding)?;

            log::debug!(
                "{}: {} every {} events on counter {}",
                self.core.name(),
                spec.name,
                period,
                counter
            );
            added.push((
                CounterEvent {
                    name: spec.name,
                    period,
                    counter,
                },
                id,
            ));
        }

        events.extend(added);
        self.core.mark_configured();
        Ok(())
    }

    fn gen_event_set(&self, thread: &Arc<ThreadContext>) -> Result<()> {
        if !self.core.is_configured() {
            return Err(Error::ordering(
                self.core.name(),
                self.core.state(),
                "gen_event_set",
            ));
        }

        let events: Vec<CounterEvent> = self
            .events
            .read()
            .iter()
            .map(|(event, _)| event.clone())
            .collect();
        let event_set = self.backend.program(thread, &events)?;
        self.core.install_event_set(thread, event_set)
    }

    fn thread_fini_action(&self, thread: &Arc<ThreadContext>) -> Result<()> {
        let event_set = thread.event_set(self.core.id());
        self.core.thread_fini(thread)?;
        match event_set {
            Some(event_set) if event_set != 0 => self.backend.release(thread, event_set),
            _ => Ok(()),
        }
    }

    fn supports_event(&self, event: &str) -> bool {
        let name = event.split('@').next().unwrap_or(event);
        self.backend.catalog().iter().any(|info| info.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceState;
    use spin::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        programmed: Mutex<Vec<(u64, Vec<CounterEvent>)>>,
        released: Mutex<Vec<u64>>,
    }

    impl CounterBackend for FakeBackend {
        fn catalog(&self) -> Vec<EventInfo> {
            vec![
                EventInfo::new("PAPI_TOT_CYC", "Total cycles"),
                EventInfo::new("PAPI_L1_DCM", "Level 1 data cache misses"),
            ]
        }

        fn program(&self, thread: &ThreadContext, events: &[CounterEvent]) -> Result<u64> {
            self.programmed
                .lock()
                .push((thread.id(), events.to_vec()));
            Ok(0x1000 + thread.id())
        }

        fn release(&self, _thread: &ThreadContext, event_set: u64) -> Result<()> {
            self.released.lock().push(event_set);
            Ok(())
        }
    }

    #[test]
    fn overflow_credits_period() {
        let registry = Arc::new(MetricRegistry::new());
        let store = CctMetricStore::new(registry.clone());
        let source = CounterSource::new("papi", FakeBackend::default());
        assert_eq!(source.class(), SyncClass::Hardware);

        source.init().unwrap();
        source
            .process_event_list("PAPI_TOT_CYC@1000 PAPI_L1_DCM", &registry)
            .unwrap();
        let cycles = source.metric_for(0).unwrap();
        let misses = source.metric_for(1).unwrap();
        assert_eq!(
            registry.describe(cycles).unwrap().to_string(),
            "PAPI_TOT_CYC [events] {PAPI_TOT_CYC:1000 ev/smpl}"
        );

        let thread = ThreadContext::new(9, "worker");
        source.thread_init(&thread).unwrap();
        source.gen_event_set(&thread).unwrap();
        assert_eq!(thread.event_set(source.id()), Some(0x1009));
        assert_eq!(source.backend().programmed.lock()[0].1.len(), 2);

        let node = store.new_node();
        assert!(!source.on_overflow(&store, &thread, &node, 0).unwrap());
        source.start(&thread).unwrap();
        source.on_overflow(&store, &thread, &node, 0).unwrap();
        source.on_overflow(&store, &thread, &node, 0).unwrap();
        source.on_overflow(&store, &thread, &node, 1).unwrap();
        assert!(!source.on_overflow(&store, &thread, &node, 5).unwrap());

        assert_eq!(store.read(&node, cycles).unwrap(), MetricValue::Int(2000));
        assert_eq!(
            store.read(&node, misses).unwrap(),
            MetricValue::Int(DEFAULT_PERIOD as i64)
        );

        source.thread_fini_action(&thread).unwrap();
        assert_eq!(*source.backend().released.lock(), vec![0x1009]);
        source.shutdown().unwrap();
        assert_eq!(source.state(), SourceState::Uninit);
    }

    #[test]
    fn full_registry_leaves_source_unconfigured() {
        let registry = Arc::new(MetricRegistry::new());
        for i in 0..MAX_METRICS - 1 {
            registry
                .register_raw(
                    &format!("filler {}", i),
                    MetricUnit::Events,
                    EventBinding::new("filler", "FILL", 1),
                )
                .unwrap();
        }

        let source = CounterSource::new("papi", FakeBackend::default());
        source.init().unwrap();
        assert!(matches!(
            source.process_event_list("PAPI_TOT_CYC PAPI_L1_DCM", &registry),
            Err(Error::RegistryFull(_))
        ));
        assert_eq!(registry.len(), MAX_METRICS - 1);
        assert!(!source.core().is_configured());
        assert_eq!(source.metric_for(0), None);

        // one event still fits and gets the first counter
        source.process_event_list("PAPI_L1_DCM", &registry).unwrap();
        let id = source.metric_for(0).unwrap();
        assert_eq!(registry.describe(id).unwrap().name, "PAPI_L1_DCM");
        assert!(source.core().is_configured());
    }

    #[test]
    fn oversized_period_rejected() {
        let registry = MetricRegistry::new();
        let source = CounterSource::new("papi", FakeBackend::default());
        source.init().unwrap();
        assert!(matches!(
            source.process_event_list("PAPI_TOT_CYC@9223372036854775808", &registry),
            Err(Error::MalformedEventSpec { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn exact_event_names() {
        let source = CounterSource::new("papi", FakeBackend::default());
        assert!(source.supports_event("PAPI_TOT_CYC"));
        assert!(source.supports_event("PAPI_TOT_CYC@100"));
        assert!(!source.supports_event("PAPI_TOT"));
        assert!(!source.supports_event("WALLCLOCK"));
    }

    #[test]
    fn gen_event_set_requires_metrics() {
        let source = CounterSource::new("papi", FakeBackend::default());
        source.init().unwrap();
        let thread = ThreadContext::new(1, "t");
        source.thread_init(&thread).unwrap();
        assert!(matches!(
            source.gen_event_set(&thread),
            Err(Error::OrderingViolation { .. })
        ));
        assert!(source.backend().programmed.lock().is_empty());
    }
}
