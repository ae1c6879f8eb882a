// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! Sampling sources and call-context metric accumulation for in-process
//! profilers.
//!
//! A [`MetricRegistry`] describes every metric a run collects, either raw
//! (bound to one source's event) or computed from other metrics. Sources
//! implementing [`SampleSource`] register their metrics while being
//! configured, and later credit measurements to the [`NodeMetrics`] of a
//! calling-context node through the [`CctMetricStore`]. The increment path
//! takes no blocking lock and never allocates, so it can run from a signal
//! handler that interrupted the very thread it is crediting.
//!
//! ```no_run
//! use std::sync::Arc;
//! use cctprof::source::memleak::MemleakSource;
//! use cctprof::{ReportBuilder, SessionBuilder};
//!
//! let memleak = Arc::new(MemleakSource::new());
//! let session = SessionBuilder::new()
//!     .source(memleak.clone())
//!     .event("MEMLEAK")
//!     .build()
//!     .unwrap();
//!
//! let node = session.store().new_node();
//! let guard = session.thread().unwrap();
//! memleak
//!     .record_alloc(session.store(), guard.context(), &node, 64)
//!     .unwrap();
//! drop(guard);
//!
//! let report = ReportBuilder::new(session.store()).node("main", &node).build().unwrap();
//! println!("{}", report);
//! ```

mod error;
pub mod eval;
pub mod expr;
pub mod metric;
pub mod registry;
pub mod store;
pub mod thread;

pub mod dispatch;
pub mod report;
pub mod session;
pub mod source;

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod platform;

cfg_if::cfg_if! {
    if #[cfg(feature = "large-metrics")] {
        /// Upper bound on the number of metrics a registry can hold.
        pub const MAX_METRICS: usize = 1024;
    } else {
        /// Upper bound on the number of metrics a registry can hold.
        pub const MAX_METRICS: usize = 256;
    }
}

/// Sources a single thread can be attached to without the per-thread table
/// spilling to the heap.
pub const MAX_SOURCES: usize = 16;

pub use error::*;
pub use eval::Evaluator;
pub use metric::{MetricDescriptor, MetricId, MetricKind, MetricUnit, MetricValue, ValueKind};
pub use registry::MetricRegistry;
pub use report::{Report, ReportBuilder};
pub use session::{Session, SessionBuilder, ThreadGuard};
pub use source::{SampleSource, SourceState, SyncClass};
pub use store::{CallPathResolver, CctMetricStore, NodeMetrics};
pub use thread::ThreadContext;

#[cfg(test)]
mod tests {
    // SIGPROF disposition and the profiling timer are process-wide.
    pub(crate) static SIGPROF_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
}
