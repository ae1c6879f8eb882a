// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use spin::RwLock;

use crate::expr::Expr;
use crate::metric::{
    EventBinding, MetricDescriptor, MetricId, MetricKind, MetricUnit, ValueKind,
};
use crate::{Error, Result, MAX_METRICS};

const KIND_MASK: u8 = 0x0f;
const COMPUTED: u8 = 0x40;
const REJECTED: u8 = 0x80;

/// Lock-free view of one registered metric, as seen by the delivery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotInfo(u8);

impl SlotInfo {
    pub(crate) fn kind(self) -> ValueKind {
        // only constructed for registered ids, whose low bits are a valid kind
        ValueKind::from_u8(self.0 & KIND_MASK).unwrap_or(ValueKind::Int)
    }

    pub(crate) fn is_computed(self) -> bool {
        self.0 & COMPUTED != 0
    }

    pub(crate) fn is_rejected(self) -> bool {
        self.0 & REJECTED != 0
    }
}

/// Append-only table of metric descriptors.
///
/// Registration allocates and takes a write lock, so it belongs to setup
/// code. Everything the asynchronous increment path needs about a metric
/// (its representation and whether it still accepts writes) is mirrored
/// into a fixed table of atomics sized `MAX_METRICS` up front.
pub struct MetricRegistry {
    descriptors: RwLock<Vec<Arc<MetricDescriptor>>>,
    slots: Box<[AtomicU8]>,
    len: AtomicUsize,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self {
            descriptors: RwLock::new(Vec::new()),
            slots: (0..MAX_METRICS).map(|_| AtomicU8::new(0)).collect(),
            len: AtomicUsize::new(0),
        }
    }

    /// Registers an integer-accumulating raw metric.
    pub fn register_raw(
        &self,
        name: &str,
        unit: MetricUnit,
        binding: EventBinding,
    ) -> Result<MetricId> {
        self.register_raw_with(name, unit, ValueKind::Int, binding)
    }

    pub fn register_raw_with(
        &self,
        name: &str,
        unit: MetricUnit,
        value_kind: ValueKind,
        binding: EventBinding,
    ) -> Result<MetricId> {
        if name.is_empty() {
            return Err(Error::EmptyMetricName);
        }

        let mut descriptors = self.descriptors.write();
        let aliased = descriptors.iter().any(|desc| match &desc.kind {
            MetricKind::Raw(existing) => existing.aliases(&binding),
            MetricKind::Computed(_) => false,
        });
        if aliased {
            return Err(Error::DuplicateEventBinding {
                source_name: binding.source,
                event: binding.event,
                counter: binding.counter.unwrap_or_default(),
            });
        }

        let id = Self::push(
            &mut descriptors,
            &self.slots,
            name,
            unit,
            value_kind,
            MetricKind::Raw(binding),
        )?;
        self.len.store(descriptors.len(), Ordering::Release);

        log::debug!("registered raw metric {} as {}", name, id);
        Ok(id)
    }

    /// Registers a metric derived from already registered ones.
    pub fn register_computed(&self, name: &str, unit: MetricUnit, expr: Expr) -> Result<MetricId> {
        if name.is_empty() {
            return Err(Error::EmptyMetricName);
        }

        let mut descriptors = self.descriptors.write();
        let registered = descriptors.len();

        let mut unknown = None;
        expr.for_each_leaf(&mut |leaf| {
            if unknown.is_none() && leaf.index() >= registered {
                unknown = Some(leaf);
            }
        });
        if let Some(leaf) = unknown {
            return Err(Error::UnknownMetricReference(leaf));
        }

        let value_kind = expr.value_kind(&|leaf: MetricId| descriptors[leaf.index()].value_kind);
        let id = Self::push(
            &mut descriptors,
            &self.slots,
            name,
            unit,
            value_kind,
            MetricKind::Computed(expr),
        )?;
        self.len.store(descriptors.len(), Ordering::Release);

        log::debug!("registered computed metric {} as {}", name, id);
        Ok(id)
    }

    fn push(
        descriptors: &mut Vec<Arc<MetricDescriptor>>,
        slots: &[AtomicU8],
        name: &str,
        unit: MetricUnit,
        value_kind: ValueKind,
        kind: MetricKind,
    ) -> Result<MetricId> {
        let index = descriptors.len();
        if index >= slots.len() {
            return Err(Error::RegistryFull(slots.len()));
        }

        let mut info = value_kind as u8;
        if let MetricKind::Computed(_) = kind {
            info |= COMPUTED;
        }

        let id = MetricId(index as u32);
        descriptors.push(Arc::new(MetricDescriptor {
            id,
            name: name.to_owned(),
            unit,
            value_kind,
            kind,
        }));
        slots[index].store(info, Ordering::Release);

        Ok(id)
    }

    pub fn describe(&self, id: MetricId) -> Result<Arc<MetricDescriptor>> {
        self.descriptors
            .read()
            .get(id.index())
            .cloned()
            .ok_or(Error::UnknownMetricId(id))
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every descriptor, in id order.
    pub fn iter(&self) -> impl Iterator<Item = Arc<MetricDescriptor>> {
        self.descriptors.read().clone().into_iter()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<MetricDescriptor>> {
        self.descriptors
            .read()
            .iter()
            .find(|desc| desc.name == name)
            .cloned()
    }

    // Must stay AS-safe: no locks, no allocation.
    #[inline]
    pub(crate) fn slot_info(&self, id: MetricId) -> Option<SlotInfo> {
        let info = self.slots.get(id.index())?.load(Ordering::Acquire);
        if info == 0 {
            None
        } else {
            Some(SlotInfo(info))
        }
    }

    pub(crate) fn reject(&self, id: MetricId) {
        if let Some(slot) = self.slots.get(id.index()) {
            slot.fetch_or(REJECTED, Ordering::AcqRel);
        }
    }

    pub fn is_rejected(&self, id: MetricId) -> bool {
        self.slot_info(id).map_or(false, SlotInfo::is_rejected)
    }

    /// Metrics that stopped accepting writes after a type mismatch.
    pub fn rejected(&self) -> Vec<MetricId> {
        (0..self.len())
            .map(|index| MetricId(index as u32))
            .filter(|id| self.is_rejected(*id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::BinaryOp;

    fn binding(event: &str) -> EventBinding {
        EventBinding::new("memleak", event, 1)
    }

    #[test]
    fn ids_are_dense() {
        let registry = MetricRegistry::new();
        let a = registry
            .register_raw("a", MetricUnit::Events, binding("A"))
            .unwrap();
        let b = registry
            .register_raw("b", MetricUnit::Samples, binding("B"))
            .unwrap();

        assert_eq!(a, MetricId(0));
        assert_eq!(b, MetricId(1));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.describe(b).unwrap().name, "b");
        assert_eq!(registry.find_by_name("a").unwrap().id, a);
    }

    #[test]
    fn duplicates_without_counter_are_distinct() {
        let registry = MetricRegistry::new();
        let a = registry
            .register_raw("bytes", MetricUnit::Events, binding("MEMLEAK"))
            .unwrap();
        let b = registry
            .register_raw("bytes", MetricUnit::Events, binding("MEMLEAK"))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn aliasing_counter_rejected() {
        let registry = MetricRegistry::new();
        let cycles = EventBinding::new("papi", "PAPI_TOT_CYC", 1000).with_counter(0);
        registry
            .register_raw("cycles", MetricUnit::Events, cycles.clone())
            .unwrap();

        match registry.register_raw("cycles again", MetricUnit::Events, cycles) {
            Err(Error::DuplicateEventBinding { counter, .. }) => assert_eq!(counter, 0),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_name() {
        let registry = MetricRegistry::new();
        assert!(matches!(
            registry.register_raw("", MetricUnit::Events, binding("A")),
            Err(Error::EmptyMetricName)
        ));
    }

    #[test]
    fn computed_requires_registered_leaves() {
        let registry = MetricRegistry::new();
        let a = registry
            .register_raw("a", MetricUnit::Events, binding("A"))
            .unwrap();

        let forward = Expr::binary(BinaryOp::Add, Expr::leaf(a), Expr::leaf(MetricId(1)));
        assert!(matches!(
            registry.register_computed("bad", MetricUnit::Events, forward),
            Err(Error::UnknownMetricReference(MetricId(1)))
        ));
        assert_eq!(registry.len(), 1);

        let ok = Expr::binary(BinaryOp::Mul, Expr::leaf(a), Expr::constant(2i64));
        let id = registry
            .register_computed("double", MetricUnit::Events, ok)
            .unwrap();
        let desc = registry.describe(id).unwrap();
        assert_eq!(desc.value_kind, ValueKind::Int);
        assert!(registry.slot_info(id).unwrap().is_computed());
    }

    #[test]
    fn describe_unknown() {
        let registry = MetricRegistry::new();
        assert!(matches!(
            registry.describe(MetricId(7)),
            Err(Error::UnknownMetricId(MetricId(7)))
        ));
        assert!(registry.slot_info(MetricId(7)).is_none());
        assert!(registry.slot_info(MetricId(u32::MAX)).is_none());
    }

    #[test]
    fn full() {
        let registry = MetricRegistry::new();
        for i in 0..MAX_METRICS {
            registry
                .register_raw(&format!("m{}", i), MetricUnit::Events, binding("A"))
                .unwrap();
        }
        assert!(matches!(
            registry.register_raw("overflow", MetricUnit::Events, binding("A")),
            Err(Error::RegistryFull(_))
        ));
    }

    #[test]
    fn reject_marks_single_metric() {
        let registry = MetricRegistry::new();
        let a = registry
            .register_raw("a", MetricUnit::Events, binding("A"))
            .unwrap();
        let b = registry
            .register_raw_with("b", MetricUnit::Events, ValueKind::Real, binding("B"))
            .unwrap();

        registry.reject(a);
        assert!(registry.is_rejected(a));
        assert!(!registry.is_rejected(b));
        assert_eq!(registry.rejected(), vec![a]);
        assert_eq!(registry.slot_info(b).unwrap().kind(), ValueKind::Real);
        assert_eq!(registry.slot_info(a).unwrap().kind(), ValueKind::Int);
    }
}
