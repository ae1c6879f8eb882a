// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::dispatch::{Lifecycle, SourceTable};
use crate::registry::MetricRegistry;
use crate::source::SampleSource;
use crate::store::CctMetricStore;
use crate::thread::ThreadContext;
use crate::Result;

/// Collects the sources and the event list of a profiling session.
pub struct SessionBuilder {
    sources: Vec<Arc<dyn SampleSource>>,
    events: Vec<String>,
    store: Option<CctMetricStore>,
}

impl Default for SessionBuilder {
    fn default() -> SessionBuilder {
        SessionBuilder {
            sources: Vec::new(),
            events: Vec::new(),
            store: None,
        }
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: Arc<dyn SampleSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// One item of the event list, `NAME` or `NAME@period`.
    pub fn event(mut self, event: &str) -> Self {
        self.events.push(event.to_owned());
        self
    }

    /// A comma or whitespace separated list of items.
    pub fn events(mut self, events: &str) -> Self {
        self.events.push(events.to_owned());
        self
    }

    /// Uses `store` (and its registry) instead of a fresh one. Needed when a
    /// source was built around the store, as the interval timer source is.
    pub fn store(mut self, store: CctMetricStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Registers the sources, initializes them and hands each one its part
    /// of the event list.
    pub fn build(self) -> Result<Session> {
        let store = self
            .store
            .unwrap_or_else(|| CctMetricStore::new(Arc::new(MetricRegistry::new())));

        let mut table = SourceTable::new();
        for source in self.sources {
            table.register(source)?;
        }

        let session = Session {
            store,
            table,
            shut_down: AtomicBool::new(false),
        };

        session.table.broadcast(Lifecycle::Init)?;
        let spec = self.events.join(",");
        session.table.configure(&spec, session.registry())?;

        log::info!(
            "session configured: {} metrics from {} sources",
            session.registry().len(),
            session.table.configured().count()
        );
        Ok(session)
    }
}

/// A configured set of sources sharing one registry and store. Dropping the
/// session shuts every source down.
pub struct Session {
    store: CctMetricStore,
    table: SourceTable,
    shut_down: AtomicBool,
}

impl Session {
    pub fn registry(&self) -> &Arc<MetricRegistry> {
        self.store.registry()
    }

    pub fn store(&self) -> &CctMetricStore {
        &self.store
    }

    pub fn sources(&self) -> &SourceTable {
        &self.table
    }

    /// Starts sampling on the calling thread.
    pub fn thread(&self) -> Result<ThreadGuard<'_>> {
        self.attach(ThreadContext::for_current_thread())
    }

    /// Sets every configured source up on `context` and starts it there.
    /// On failure whatever was set up is torn down again.
    pub fn attach(&self, context: Arc<ThreadContext>) -> Result<ThreadGuard<'_>> {
        let setup = [
            Lifecycle::ThreadInit(&context),
            Lifecycle::GenEventSet(&context),
            Lifecycle::Start(&context),
        ];
        for op in setup {
            if let Err(err) = self.table.broadcast(op) {
                log::error!("setting up {} failed: {}", context.name(), err);
                for undo in [Lifecycle::Stop(&context), Lifecycle::ThreadFini(&context)] {
                    if let Err(undo_err) = self.table.broadcast(undo) {
                        log::warn!(
                            "rolling back {} on {} failed: {}",
                            undo.name(),
                            context.name(),
                            undo_err
                        );
                    }
                }
                return Err(err);
            }
        }

        Ok(ThreadGuard {
            session: self,
            context,
        })
    }

    /// Shuts every source down. Only the first call has an effect.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = self.table.broadcast(Lifecycle::Shutdown);
        for id in self.registry().rejected() {
            match self.registry().describe(id) {
                Ok(desc) => log::warn!("metric {} ({}) was rejected after a type mismatch", id, desc.name),
                Err(_) => log::warn!("metric {} was rejected after a type mismatch", id),
            }
        }
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("error while shutting down session {}", err);
        }
    }
}

/// RAII structure used to stop sampling on one thread when dropped.
pub struct ThreadGuard<'a> {
    session: &'a Session,
    context: Arc<ThreadContext>,
}

impl ThreadGuard<'_> {
    pub fn context(&self) -> &Arc<ThreadContext> {
        &self.context
    }

    /// Stops every source on this thread; accumulated values are kept.
    pub fn pause(&self) -> Result<()> {
        self.session.table.broadcast(Lifecycle::Stop(&self.context))
    }

    pub fn resume(&self) -> Result<()> {
        self.session.table.broadcast(Lifecycle::Start(&self.context))
    }
}

impl Drop for ThreadGuard<'_> {
    fn drop(&mut self) {
        let table = &self.session.table;
        if let Err(err) = table.broadcast(Lifecycle::Stop(&self.context)) {
            log::error!("error while stopping {}: {}", self.context.name(), err);
        }
        if let Err(err) = table.broadcast(Lifecycle::ThreadFini(&self.context)) {
            log::error!("error while finishing {}: {}", self.context.name(), err);
        }

        let installed =
            ThreadContext::with_current(|current| std::ptr::eq(current, &*self.context));
        if installed == Some(true) {
            ThreadContext::uninstall();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::Evaluator;
    use crate::metric::MetricValue;
    use crate::source::memleak::MemleakSource;
    use crate::source::rcce::RcceSource;
    use crate::source::counter::{CounterBackend, CounterEvent, CounterSource};
    use crate::source::{EventInfo, SourceState};
    use crate::Error;

    #[test]
    fn memleak_session() {
        let memleak = Arc::new(MemleakSource::new());
        let session = SessionBuilder::new()
            .source(memleak.clone())
            .source(Arc::new(RcceSource::new()))
            .event("MEMLEAK")
            .build()
            .unwrap();

        assert_eq!(session.registry().len(), 3);
        assert_eq!(session.sources().configured().count(), 1);

        let store = session.store();
        let node = store.new_node();
        {
            let guard = session.thread().unwrap();
            let thread = guard.context();
            assert!(memleak.is_active(thread));

            memleak.record_alloc(store, thread, &node, 100).unwrap();
            memleak.record_alloc(store, thread, &node, 50).unwrap();
            memleak.record_free(store, thread, &node, 30).unwrap();

            guard.pause().unwrap();
            assert!(!memleak.record_alloc(store, thread, &node, 1000).unwrap());

            guard.resume().unwrap();
            memleak.record_free(store, thread, &node, 20).unwrap();
        }

        let evaluator = Evaluator::new(store);
        let leaked = memleak.leak_id().unwrap();
        assert_eq!(evaluator.evaluate(&node, leaked).unwrap(), MetricValue::Int(100));

        session.shutdown().unwrap();
        assert_eq!(memleak.state(), SourceState::Uninit);
        session.shutdown().unwrap();
    }

    #[test]
    fn threads_accumulate_into_shared_node() {
        let rcce = Arc::new(RcceSource::new());
        let session = SessionBuilder::new()
            .source(rcce.clone())
            .events("RCCE")
            .build()
            .unwrap();
        let store = session.store();
        let node = store.new_node();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let guard = session.thread().unwrap();
                    for _ in 0..1000 {
                        rcce.receive_inc(store, guard.context(), Some(&node), 64)
                            .unwrap();
                        rcce.receive_freq_inc(store, guard.context(), Some(&node), 1)
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(
            store.read(&node, rcce.receive_id().unwrap()).unwrap(),
            MetricValue::Int(4 * 1000 * 64)
        );
        assert_eq!(
            store.read(&node, rcce.receive_freq_id().unwrap()).unwrap(),
            MetricValue::Int(4000)
        );
    }

    #[test]
    fn guard_drop_detaches() {
        let memleak = Arc::new(MemleakSource::new());
        let session = SessionBuilder::new()
            .source(memleak.clone())
            .event("MEMLEAK")
            .build()
            .unwrap();

        let context = ThreadContext::new(42, "worker");
        let guard = session.attach(context.clone()).unwrap();
        assert!(context.is_started(memleak.id()));
        drop(guard);
        assert!(!context.is_attached(memleak.id()));
        assert_eq!(memleak.state(), SourceState::Stopped);
    }

    #[test]
    fn unknown_event_fails_build() {
        let memleak = Arc::new(MemleakSource::new());
        let result = SessionBuilder::new()
            .source(memleak.clone())
            .event("PAPI_TOT_CYC")
            .build();
        assert!(matches!(result, Err(Error::NoMatchingSource(_))));
        // the half-built session was shut down on drop
        assert_eq!(memleak.state(), SourceState::Uninit);
    }

    #[test]
    fn overlapping_sources_fail_build() {
        let result = SessionBuilder::new()
            .source(Arc::new(MemleakSource::new()))
            .source(Arc::new(MemleakSource::new()))
            .event("MEMLEAK")
            .build();
        assert!(matches!(
            result,
            Err(Error::OverlappingEventNamespace { .. })
        ));
    }

    struct RefusingBackend;

    impl CounterBackend for RefusingBackend {
        fn catalog(&self) -> Vec<EventInfo> {
            vec![EventInfo::new("PAPI_TOT_CYC", "Total cycles")]
        }

        fn program(&self, _thread: &ThreadContext, _events: &[CounterEvent]) -> Result<u64> {
            Err(Error::NixError(nix::Error::EBUSY))
        }

        fn release(&self, _thread: &ThreadContext, _event_set: u64) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_attach_rolls_back() {
        let memleak = Arc::new(MemleakSource::new());
        let counter = Arc::new(CounterSource::new("papi", RefusingBackend));
        let session = SessionBuilder::new()
            .source(memleak.clone())
            .source(counter.clone())
            .events("MEMLEAK PAPI_TOT_CYC")
            .build()
            .unwrap();

        let context = ThreadContext::new(5, "refused");
        assert!(matches!(
            session.attach(context.clone()),
            Err(Error::NixError(_))
        ));
        assert!(!context.is_attached(memleak.id()));
        assert!(!context.is_attached(counter.id()));
        assert!(!memleak.is_active(&context));
    }

    #[test]
    fn shared_store() {
        let registry = Arc::new(MetricRegistry::new());
        let store = CctMetricStore::new(registry.clone());
        let session = SessionBuilder::new()
            .source(Arc::new(RcceSource::new()))
            .event("RCCE")
            .store(store)
            .build()
            .unwrap();
        assert!(Arc::ptr_eq(session.registry(), &registry));
        assert_eq!(registry.len(), 3);
    }
}
