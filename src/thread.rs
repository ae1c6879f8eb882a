// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;
use spin::RwLock;

use crate::source::SourceId;
use crate::MAX_SOURCES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Stopped = 0,
    Started = 1,
}

impl RunState {
    fn from_u8(v: u8) -> RunState {
        if v == RunState::Started as u8 {
            RunState::Started
        } else {
            RunState::Stopped
        }
    }
}

/// Event-set handle stored for sources that are driven purely by explicit
/// calls from instrumented code.
pub const SENTINEL_EVENT_SET: u64 = 0xDEAD;

struct SourceSlot {
    source: SourceId,
    run: AtomicU8,
    event_set: AtomicU64,
}

/// State of one monitored thread: for every source attached to it, the
/// per-thread run state and the event set the source generated.
///
/// The table is filled while the thread is being set up. Lookups done on the
/// delivery path use `try_read` and a linear scan, so they neither block nor
/// allocate.
pub struct ThreadContext {
    id: u64,
    name: String,
    sources: RwLock<SmallVec<[SourceSlot; MAX_SOURCES]>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadContext>>> = const { RefCell::new(None) };
}

impl ThreadContext {
    pub fn new(id: u64, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            sources: RwLock::new(SmallVec::new()),
        })
    }

    /// Context for the calling thread, identified by its pthread handle.
    pub fn for_current_thread() -> Arc<Self> {
        let current = std::thread::current();
        let id = unsafe { libc::pthread_self() } as u64;
        let name = match current.name() {
            Some(name) => name.to_owned(),
            None => id.to_string(),
        };

        Self::new(id, name)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes `self` the context returned by [`ThreadContext::with_current`]
    /// on this thread.
    pub fn install(self: &Arc<Self>) {
        CURRENT.with(|current| {
            *current.borrow_mut() = Some(self.clone());
        });
    }

    pub fn uninstall() {
        let _ = CURRENT.try_with(|current| current.borrow_mut().take());
    }

    // This function has to be AS-safe
    pub fn with_current<R, F: FnOnce(&ThreadContext) -> R>(f: F) -> Option<R> {
        CURRENT
            .try_with(|current| {
                let current = current.try_borrow().ok()?;
                current.as_deref().map(f)
            })
            .ok()
            .flatten()
    }

    pub(crate) fn attach(&self, source: SourceId) {
        let mut sources = self.sources.write();
        if sources.iter().all(|slot| slot.source != source) {
            sources.push(SourceSlot {
                source,
                run: AtomicU8::new(RunState::Stopped as u8),
                event_set: AtomicU64::new(0),
            });
        }
    }

    pub(crate) fn detach(&self, source: SourceId) {
        self.sources.write().retain(|slot| slot.source != source);
    }

    pub fn is_attached(&self, source: SourceId) -> bool {
        self.with_slot(source, |_| ()).is_some()
    }

    // Setup and teardown paths wait for a concurrent attach/detach instead of
    // mistaking a held lock for a missing slot.
    fn with_slot<R, F: FnOnce(&SourceSlot) -> R>(&self, source: SourceId, f: F) -> Option<R> {
        let sources = self.sources.read();
        sources.iter().find(|slot| slot.source == source).map(f)
    }

    // This function has to be AS-safe
    #[inline]
    fn try_with_slot<R, F: FnOnce(&SourceSlot) -> R>(&self, source: SourceId, f: F) -> Option<R> {
        let sources = self.sources.try_read()?;
        sources.iter().find(|slot| slot.source == source).map(f)
    }

    /// `None` when the source was never attached to this thread.
    pub fn run_state(&self, source: SourceId) -> Option<RunState> {
        self.with_slot(source, |slot| RunState::from_u8(slot.run.load(Ordering::Acquire)))
    }

    /// Delivery-path check. Reports `false` while the table is being
    /// modified.
    // This function has to be AS-safe
    #[inline]
    pub fn is_started(&self, source: SourceId) -> bool {
        self.try_with_slot(source, |slot| slot.run.load(Ordering::Acquire))
            == Some(RunState::Started as u8)
    }

    /// Returns the previous state, or `None` when the source is not attached.
    pub(crate) fn set_run_state(&self, source: SourceId, state: RunState) -> Option<RunState> {
        self.with_slot(source, |slot| {
            RunState::from_u8(slot.run.swap(state as u8, Ordering::AcqRel))
        })
    }

    pub fn event_set(&self, source: SourceId) -> Option<u64> {
        self.with_slot(source, |slot| slot.event_set.load(Ordering::Acquire))
    }

    pub(crate) fn set_event_set(&self, source: SourceId, event_set: u64) -> bool {
        self.with_slot(source, |slot| slot.event_set.store(event_set, Ordering::Release))
            .is_some()
    }
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
