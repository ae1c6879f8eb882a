// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! Software source driven by the profiling interval timer. Every `SIGPROF`
//! credits one period (in microseconds) to the node the resolver returns
//! for the interrupted program counter.

use std::os::raw::c_int;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spin::{Mutex, RwLock};

use crate::metric::{EventBinding, MetricId, MetricUnit, MetricValue};
use crate::platform::{self, ErrnoProtector, Timer};
use crate::registry::MetricRegistry;
use crate::source::{
    requested_events, EventInfo, MetricCell, SampleSource, SourceCore, SourceId, SyncClass,
};
use crate::store::{CallPathResolver, CctMetricStore};
use crate::thread::ThreadContext;
use crate::Result;

pub const EVENT: &str = "WALLCLOCK";

/// Microseconds between samples when the event item carries no `@period`.
pub const DEFAULT_PERIOD_US: u64 = 5000;

struct Shared {
    source: SourceId,
    store: CctMetricStore,
    resolver: Arc<dyn CallPathResolver>,
    metric: MetricCell,
    period_us: AtomicU64,
}

impl Shared {
    // This function has to be AS-safe
    fn sample(&self, thread: &ThreadContext, pc: usize) {
        if !thread.is_started(self.source) {
            return;
        }

        let id = match self.metric.get() {
            Some(id) => id,
            None => return,
        };

        if let Some(node) = self.resolver.resolve(thread, pc) {
            let period = self.period_us.load(Ordering::Relaxed) as i64;
            let _ = self.store.increment(node, id, MetricValue::Int(period));
        }
    }
}

static HANDLER_TARGET: RwLock<Option<Arc<Shared>>> = RwLock::new(None);

#[no_mangle]
extern "C" fn itimer_signal_handler(
    _signal: c_int,
    _siginfo: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let _errno = ErrnoProtector::new();

    if let Some(target) = HANDLER_TARGET.try_read() {
        if let Some(shared) = target.as_ref() {
            let pc = platform::interrupted_pc(ucontext);
            ThreadContext::with_current(|thread| shared.sample(thread, pc));
        }
    }
}

pub struct ItimerSource {
    core: SourceCore,
    shared: Arc<Shared>,
    timer: Mutex<Option<Timer>>,
}

impl ItimerSource {
    pub fn new(store: CctMetricStore, resolver: Arc<dyn CallPathResolver>) -> Self {
        let core = SourceCore::new("itimer", SyncClass::Software);
        let shared = Arc::new(Shared {
            source: core.id(),
            store,
            resolver,
            metric: MetricCell::new(),
            period_us: AtomicU64::new(DEFAULT_PERIOD_US),
        });

        Self {
            core,
            shared,
            timer: Mutex::new(None),
        }
    }

    pub fn metric_id(&self) -> Option<MetricId> {
        self.shared.metric.get()
    }

    pub fn period(&self) -> Duration {
        Duration::from_micros(self.shared.period_us.load(Ordering::Relaxed))
    }

    fn disarm(&self) -> Result<()> {
        drop(self.timer.lock().take());

        let mut target = HANDLER_TARGET.write();
        let ours = target
            .as_ref()
            .map_or(false, |shared| Arc::ptr_eq(shared, &self.shared));
        if ours {
            *target = None;
            drop(target);
            platform::unregister()?;
        }

        Ok(())
    }
}

impl SampleSource for ItimerSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    fn events(&self) -> Vec<EventInfo> {
        vec![EventInfo::new(
            EVENT,
            "Microseconds of CPU time, sampled with a profiling interval timer",
        )]
    }

    fn init(&self) -> Result<()> {
        self.shared.metric.reset();
        self.shared
            .period_us
            .store(DEFAULT_PERIOD_US, Ordering::Relaxed);
        self.core.init()
    }

    fn process_event_list(&self, spec: &str, registry: &MetricRegistry) -> Result<()> {
        self.core.begin_configure()?;
        let events = requested_events(self, spec)?;
        if self.shared.metric.get().is_some() {
            return Ok(());
        }

        let period = events[0].period_or(DEFAULT_PERIOD_US);
        let id = registry.register_raw(
            "WALLCLOCK (us)",
            MetricUnit::Events,
            EventBinding::new(self.core.name(), EVENT, period),
        )?;

        self.shared.period_us.store(period, Ordering::Relaxed);
        self.shared.metric.set(id);
        self.core.mark_configured();
        Ok(())
    }

    /// Installs the `SIGPROF` handler and arms the timer. The timer is
    /// process-wide, so only the first call arms it; later threads just
    /// record the period as their event set.
    fn gen_event_set(&self, thread: &Arc<ThreadContext>) -> Result<()> {
        let period = self.shared.period_us.load(Ordering::Relaxed);
        self.core.install_event_set(thread, period)?;

        let mut timer = self.timer.lock();
        if timer.is_none() {
            *HANDLER_TARGET.write() = Some(self.shared.clone());
            platform::register(itimer_signal_handler)?;
            *timer = Some(Timer::arm(Duration::from_micros(period))?);
            log::info!("itimer: sampling every {} us", period);
        }

        Ok(())
    }

    fn thread_init_action(&self, thread: &Arc<ThreadContext>) -> Result<()> {
        thread.install();
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        let stopped = self.core.shutdown();
        self.disarm()?;
        stopped
    }

    fn supports_event(&self, event: &str) -> bool {
        event.contains(EVENT)
    }
}
