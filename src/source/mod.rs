// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! Sampling sources and the lifecycle they share.
//!
//! Every source owns a [`SourceCore`] holding its process-wide state
//! (`Uninit -> Init -> Started <-> Stopped -> Uninit`) and the list of
//! threads it was set up on. The per-thread run state lives in each
//! thread's [`ThreadContext`], keyed by the source's [`SourceId`].

use std::fmt::{Display, Error as FmtError, Formatter};
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::metric::{MetricId, MetricValue};
use crate::registry::MetricRegistry;
use crate::store::{CctMetricStore, NodeMetrics};
use crate::thread::{RunState, ThreadContext};
use crate::{Error, Result};

pub mod counter;
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub mod itimer;
pub mod memleak;
pub mod rcce;

/// Process-unique identity of a source instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u32);

impl SourceId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        SourceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Whether a source may be triggered both synchronously (from instrumented
/// code) and asynchronously, or only by hardware interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncClass {
    Software,
    Hardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SourceState {
    Uninit = 0,
    Init = 1,
    Started = 2,
    Stopped = 3,
}

impl SourceState {
    fn from_u8(v: u8) -> SourceState {
        match v {
            1 => SourceState::Init,
            2 => SourceState::Started,
            3 => SourceState::Stopped,
            _ => SourceState::Uninit,
        }
    }
}

/// One entry of a source's event catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub name: String,
    pub description: String,
}

impl EventInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// A single requested event: `NAME` or `NAME@period`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSpec {
    pub name: String,
    pub period: Option<u64>,
}

impl EventSpec {
    pub fn period_or(&self, default: u64) -> u64 {
        self.period.unwrap_or(default)
    }
}

impl FromStr for EventSpec {
    type Err = Error;

    fn from_str(item: &str) -> Result<Self> {
        let malformed = |reason| Error::MalformedEventSpec {
            spec: item.to_owned(),
            reason,
        };

        let (name, period) = match item.split_once('@') {
            None => (item, None),
            Some((name, period)) => (name, Some(period)),
        };

        if name.is_empty() {
            return Err(malformed("missing event name"));
        }

        let period = match period {
            None => None,
            Some("") => return Err(malformed("missing period after '@'")),
            Some(period) => match period.parse::<u64>() {
                Ok(0) => return Err(malformed("period must be positive")),
                // periods are credited as signed integer deltas
                Ok(period) if period > i64::MAX as u64 => {
                    return Err(malformed("period does not fit a signed 64-bit count"))
                }
                Ok(period) => Some(period),
                Err(_) => return Err(malformed("period is not a decimal integer")),
            },
        };

        Ok(EventSpec {
            name: name.to_owned(),
            period,
        })
    }
}

impl Display for EventSpec {
    fn fmt(&self, f: &mut Formatter) -> std::result::Result<(), FmtError> {
        match self.period {
            Some(period) => write!(f, "{}@{}", self.name, period),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Splits an event list on commas and whitespace and parses every item.
pub fn parse_event_list(spec: &str) -> Result<Vec<EventSpec>> {
    spec.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(EventSpec::from_str)
        .collect()
}

/// The contract every sampling source implements.
///
/// The lifecycle methods have default implementations that delegate to the
/// source's [`SourceCore`]; concrete sources override the ones for which
/// they own resources.
pub trait SampleSource: Send + Sync {
    fn core(&self) -> &SourceCore;

    /// Catalog used by [`SampleSource::display_events`] and by the dispatch
    /// table to detect overlapping event namespaces.
    fn events(&self) -> Vec<EventInfo>;

    /// Resets the source's private bookkeeping and enters `Init`.
    fn init(&self) -> Result<()>;

    /// Parses the requested events and registers the metrics they feed.
    fn process_event_list(&self, spec: &str, registry: &MetricRegistry) -> Result<()>;

    /// Configures the trigger mechanism for one thread.
    fn gen_event_set(&self, thread: &Arc<ThreadContext>) -> Result<()>;

    fn supports_event(&self, event: &str) -> bool;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn id(&self) -> SourceId {
        self.core().id()
    }

    fn class(&self) -> SyncClass {
        self.core().class()
    }

    fn state(&self) -> SourceState {
        self.core().state()
    }

    fn thread_init(&self, thread: &Arc<ThreadContext>) -> Result<()> {
        self.core().thread_init(thread)
    }

    fn thread_init_action(&self, _thread: &Arc<ThreadContext>) -> Result<()> {
        log::trace!("{}: thread action (noop)", self.name());
        Ok(())
    }

    fn start(&self, thread: &Arc<ThreadContext>) -> Result<()> {
        self.core().start(thread)
    }

    fn stop(&self, thread: &Arc<ThreadContext>) -> Result<()> {
        self.core().stop(thread)
    }

    fn thread_fini_action(&self, thread: &Arc<ThreadContext>) -> Result<()> {
        self.core().thread_fini(thread)
    }

    fn shutdown(&self) -> Result<()> {
        self.core().shutdown()
    }

    /// Whether deliveries on `thread` are currently accepted.
    fn is_active(&self, thread: &ThreadContext) -> bool {
        self.core().accepts(thread)
    }

    fn display_events(&self, out: &mut dyn Write) -> io::Result<()> {
        const RULE: &str =
            "===========================================================================";
        const THIN: &str =
            "---------------------------------------------------------------------------";

        writeln!(out, "{}", RULE)?;
        writeln!(out, "Available {} events", self.name())?;
        writeln!(out, "{}", RULE)?;
        writeln!(out, "Name\t\tDescription")?;
        writeln!(out, "{}", THIN)?;
        for event in self.events() {
            writeln!(out, "{}\t\t{}", event.name, event.description)?;
        }
        writeln!(out)
    }
}

/// Lifecycle bookkeeping shared by all sources.
pub struct SourceCore {
    id: SourceId,
    name: &'static str,
    class: SyncClass,
    state: AtomicU8,
    configured: AtomicBool,
    threads: Mutex<Vec<Weak<ThreadContext>>>,
}

impl SourceCore {
    pub fn new(name: &'static str, class: SyncClass) -> Self {
        Self {
            id: SourceId::next(),
            name,
            class,
            state: AtomicU8::new(SourceState::Uninit as u8),
            configured: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn class(&self) -> SyncClass {
        self.class
    }

    pub fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SourceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    /// Enters `Init` from `Uninit` (first start, or after a shutdown).
    /// Calling it again while still in `Init` only resets the bookkeeping.
    pub fn init(&self) -> Result<()> {
        match self.state() {
            SourceState::Uninit | SourceState::Init => {
                self.configured.store(false, Ordering::Release);
                self.threads.lock().clear();
                self.set_state(SourceState::Init);
                log::info!("{}: init", self.name);
                Ok(())
            }
            state => Err(Error::ordering(self.name, state, "init")),
        }
    }

    /// Guards `process_event_list`: the source must be initialized and not
    /// yet sampling.
    pub fn begin_configure(&self) -> Result<()> {
        match self.state() {
            SourceState::Init | SourceState::Stopped => Ok(()),
            state => Err(Error::ordering(self.name, state, "process_event_list")),
        }
    }

    pub fn mark_configured(&self) {
        self.configured.store(true, Ordering::Release);
    }

    pub fn thread_init(&self, thread: &Arc<ThreadContext>) -> Result<()> {
        let state = self.state();
        if state == SourceState::Uninit {
            return Err(Error::ordering(self.name, state, "thread_init"));
        }

        thread.attach(self.id);
        let mut threads = self.threads.lock();
        threads.retain(|t| t.strong_count() > 0);
        if !threads.iter().any(|t| t.as_ptr() == Arc::as_ptr(thread)) {
            threads.push(Arc::downgrade(thread));
        }
        log::debug!("{}: thread init for {}", self.name, thread.name());
        Ok(())
    }

    /// Stores the trigger handle generated for `thread`. Requires metrics to
    /// have been registered and the thread to have been initialized.
    pub fn install_event_set(&self, thread: &ThreadContext, event_set: u64) -> Result<()> {
        if !self.is_configured() {
            return Err(Error::ordering(self.name, self.state(), "gen_event_set"));
        }
        if !thread.set_event_set(self.id, event_set) {
            return Err(Error::ordering(self.name, self.state(), "gen_event_set"));
        }

        Ok(())
    }

    pub fn start(&self, thread: &ThreadContext) -> Result<()> {
        let state = self.state();
        if state == SourceState::Uninit {
            return Err(Error::ordering(self.name, state, "start"));
        }
        if !thread.is_attached(self.id) {
            return Err(Error::ordering(self.name, state, "start"));
        }

        if thread.set_run_state(self.id, RunState::Started).is_none() {
            return Err(Error::ordering(self.name, state, "start"));
        }
        log::info!("{}: starting on {}", self.name, thread.name());
        self.set_state(SourceState::Started);
        Ok(())
    }

    /// Idempotent; stopping an unknown or already stopped thread is a no-op.
    pub fn stop(&self, thread: &ThreadContext) -> Result<()> {
        if thread.set_run_state(self.id, RunState::Stopped) == Some(RunState::Started) {
            log::info!("{}: stopping on {}", self.name, thread.name());
        }

        if self.state() == SourceState::Started && !self.any_started() {
            self.set_state(SourceState::Stopped);
        }
        Ok(())
    }

    fn any_started(&self) -> bool {
        self.threads
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .any(|thread| thread.run_state(self.id) == Some(RunState::Started))
    }

    pub fn thread_fini(&self, thread: &Arc<ThreadContext>) -> Result<()> {
        self.stop(thread)?;
        thread.detach(self.id);
        self.threads
            .lock()
            .retain(|t| t.strong_count() > 0 && t.as_ptr() != Arc::as_ptr(thread));
        log::debug!("{}: thread fini for {}", self.name, thread.name());
        Ok(())
    }

    /// Stops every thread still started, then returns to `Uninit`.
    pub fn shutdown(&self) -> Result<()> {
        let threads: Vec<_> = self
            .threads
            .lock()
            .drain(..)
            .filter_map(|t| t.upgrade())
            .collect();
        for thread in threads.iter() {
            self.stop(thread)?;
        }

        self.configured.store(false, Ordering::Release);
        self.set_state(SourceState::Uninit);
        log::info!("{}: shutdown", self.name);
        Ok(())
    }

    // This function has to be AS-safe
    #[inline]
    pub fn accepts(&self, thread: &ThreadContext) -> bool {
        thread.is_started(self.id)
    }

    /// Credits `delta` to `id` on `node` if this source is started on
    /// `thread`. Returns `Ok(false)` when the delivery was dropped because
    /// the thread is stopped.
    // This function has to be AS-safe
    #[inline]
    pub fn deliver(
        &self,
        store: &CctMetricStore,
        thread: &ThreadContext,
        node: &NodeMetrics,
        id: MetricId,
        delta: MetricValue,
    ) -> Result<bool> {
        if !self.accepts(thread) {
            return Ok(false);
        }

        store.increment(node, id, delta)?;
        Ok(true)
    }
}

/// Metric id owned privately by a source, readable from the delivery path.
pub struct MetricCell(AtomicU32);

impl MetricCell {
    const UNSET: u32 = u32::MAX;

    pub const fn new() -> Self {
        MetricCell(AtomicU32::new(Self::UNSET))
    }

    #[inline]
    pub fn get(&self) -> Option<MetricId> {
        match self.0.load(Ordering::Acquire) {
            Self::UNSET => None,
            id => Some(MetricId(id)),
        }
    }

    pub fn set(&self, id: MetricId) {
        self.0.store(id.0, Ordering::Release);
    }

    pub fn reset(&self) {
        self.0.store(Self::UNSET, Ordering::Release);
    }
}

impl Default for MetricCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses `spec` and checks every item is claimed by `source`.
pub(crate) fn requested_events<S: SampleSource + ?Sized>(
    source: &S,
    spec: &str,
) -> Result<Vec<EventSpec>> {
    let events = parse_event_list(spec)?;
    if events.is_empty() {
        return Err(Error::MalformedEventSpec {
            spec: spec.to_owned(),
            reason: "empty event list",
        });
    }
    if let Some(event) = events.iter().find(|e| !source.supports_event(&e.name)) {
        return Err(Error::MalformedEventSpec {
            spec: event.to_string(),
            reason: "event not recognized by this source",
        });
    }

    Ok(events)
}
