// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use spin::RwLock;

use crate::metric::{MetricId, MetricValue, ValueKind};
use crate::registry::{MetricRegistry, SlotInfo};
use crate::thread::ThreadContext;
use crate::{Error, Result};

/// Accumulator slots owned by one call-context-tree node.
///
/// Each slot holds the raw bits of an `i64` or an `f64`; which one is
/// decided by the registry entry of the metric. The vector only grows, and
/// only outside of the delivery path.
pub struct NodeMetrics {
    slots: RwLock<Box<[AtomicU64]>>,
    dropped: AtomicU64,
}

impl NodeMetrics {
    pub fn new(width: usize) -> Self {
        Self {
            slots: RwLock::new(Self::zeroed(width)),
            dropped: AtomicU64::new(0),
        }
    }

    fn zeroed(width: usize) -> Box<[AtomicU64]> {
        (0..width).map(|_| AtomicU64::new(0)).collect()
    }

    pub fn width(&self) -> usize {
        self.slots.read().len()
    }

    /// Number of deliveries that could not be applied to this node, either
    /// because the slot did not exist yet or because the vector was being
    /// resized.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn grow(&self, width: usize) {
        let mut slots = self.slots.write();
        if slots.len() >= width {
            return;
        }

        let grown = Self::zeroed(width);
        for (old, new) in slots.iter().zip(grown.iter()) {
            new.store(old.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        *slots = grown;
    }

    // This function has to be AS-safe
    #[inline]
    fn with_slot<F: FnOnce(&AtomicU64)>(&self, id: MetricId, f: F) {
        match self.slots.try_read() {
            Some(slots) => match slots.get(id.index()) {
                Some(slot) => f(slot),
                None => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Unwinder contract: maps the interrupted program counter of a thread to
/// the node that should be credited. The resolver owns the tree, so nodes
/// outlive every delivery that borrows them.
pub trait CallPathResolver: Send + Sync {
    // This function has to be AS-safe
    fn resolve(&self, thread: &ThreadContext, pc: usize) -> Option<&NodeMetrics>;
}

/// Increment/set/read protocol over [`NodeMetrics`].
///
/// `increment` and `set` never allocate and never block: slot updates are
/// single atomic operations (or a compare-exchange loop for reals), and the
/// only lock involved is taken with `try_read`, dropping the delivery when a
/// resize holds it.
#[derive(Clone)]
pub struct CctMetricStore {
    registry: Arc<MetricRegistry>,
}

impl CctMetricStore {
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    /// Slot vector for a freshly created node, wide enough for every metric
    /// registered so far.
    pub fn new_node(&self) -> NodeMetrics {
        NodeMetrics::new(self.registry.len())
    }

    /// Widens `node` to cover metrics registered after it was created. May
    /// allocate; never call it from a signal handler.
    pub fn sync_width(&self, node: &NodeMetrics) {
        let len = self.registry.len();
        if node.width() < len {
            node.grow(len);
        }
    }

    #[inline]
    fn writable(&self, id: MetricId) -> Result<SlotInfo> {
        let info = self
            .registry
            .slot_info(id)
            .ok_or(Error::UnknownMetricId(id))?;
        if info.is_computed() {
            return Err(Error::NotRawMetric(id));
        }
        if info.is_rejected() {
            return Err(Error::MetricRejected(id));
        }

        Ok(info)
    }

    #[inline]
    fn coerce(&self, id: MetricId, info: SlotInfo, value: MetricValue) -> Result<MetricValue> {
        match (info.kind(), value) {
            (ValueKind::Int, MetricValue::Real(_)) => {
                self.registry.reject(id);
                Err(Error::TypeMismatch {
                    id,
                    expected: ValueKind::Int,
                    found: ValueKind::Real,
                })
            }
            (ValueKind::Real, MetricValue::Int(v)) => Ok(MetricValue::Real(v as f64)),
            (_, value) => Ok(value),
        }
    }

    /// Adds `delta` to the slot of `id` on `node`.
    ///
    /// A real delta sent to an integer metric is a type mismatch: the
    /// metric is rejected for the rest of the run. An integer delta sent to
    /// a real metric is widened.
    // This function has to be AS-safe
    pub fn increment(&self, node: &NodeMetrics, id: MetricId, delta: MetricValue) -> Result<()> {
        let info = self.writable(id)?;
        let delta = self.coerce(id, info, delta)?;

        node.with_slot(id, |slot| match delta {
            MetricValue::Int(d) => {
                slot.fetch_add(d as u64, Ordering::Relaxed);
            }
            MetricValue::Real(d) => {
                let _ = slot.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                    Some((f64::from_bits(bits) + d).to_bits())
                });
            }
        });

        Ok(())
    }

    // This function has to be AS-safe
    pub fn set(&self, node: &NodeMetrics, id: MetricId, value: MetricValue) -> Result<()> {
        let info = self.writable(id)?;
        let value = self.coerce(id, info, value)?;

        node.with_slot(id, |slot| slot.store(value.to_bits(), Ordering::Relaxed));

        Ok(())
    }

    /// Current value of a raw metric. Slots the node does not have yet read
    /// as zero.
    pub fn read(&self, node: &NodeMetrics, id: MetricId) -> Result<MetricValue> {
        let info = self
            .registry
            .slot_info(id)
            .ok_or(Error::UnknownMetricId(id))?;
        if info.is_computed() {
            return Err(Error::NotRawMetric(id));
        }

        let slots = node.slots.read();
        let bits = slots
            .get(id.index())
            .map_or(0, |slot| slot.load(Ordering::Relaxed));

        Ok(MetricValue::from_bits(info.kind(), bits))
    }
}
