// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use crate::expr::Expr;
use crate::metric::{MetricDescriptor, MetricId, MetricKind, MetricValue};
use crate::store::{CctMetricStore, NodeMetrics};
use crate::{Error, Result};

/// Evaluates metrics over a node's accumulators at reporting time.
///
/// The descriptor table is snapshotted when the evaluator is created, so
/// evaluation takes no registry lock and can run from several reporting
/// threads at once.
pub struct Evaluator<'a> {
    store: &'a CctMetricStore,
    descriptors: Vec<Arc<MetricDescriptor>>,
}

impl<'a> Evaluator<'a> {
    pub fn new(store: &'a CctMetricStore) -> Self {
        Self {
            store,
            descriptors: store.registry().iter().collect(),
        }
    }

    fn descriptor(&self, id: MetricId) -> Result<&MetricDescriptor> {
        self.descriptors
            .get(id.index())
            .map(|desc| desc.as_ref())
            .ok_or(Error::UnknownMetricId(id))
    }

    /// Value of `id` on `node`: the accumulator for raw metrics, the
    /// expression over other metrics for computed ones.
    pub fn evaluate(&self, node: &NodeMetrics, id: MetricId) -> Result<MetricValue> {
        match &self.descriptor(id)?.kind {
            MetricKind::Raw(_) => self.store.read(node, id),
            MetricKind::Computed(expr) => self.evaluate_expr(node, expr),
        }
    }

    /// Every registered metric on `node`, in id order.
    pub fn evaluate_all(&self, node: &NodeMetrics) -> Result<Vec<MetricValue>> {
        self.descriptors
            .iter()
            .map(|desc| self.evaluate(node, desc.id))
            .collect()
    }

    // Leaves only reference metrics registered before the expression's own
    // metric, so expanding a computed leaf in place always terminates.
    fn evaluate_expr(&self, node: &NodeMetrics, expr: &Expr) -> Result<MetricValue> {
        Ok(match expr {
            Expr::Leaf(id) => self.evaluate(node, *id)?,
            Expr::Constant(v) => *v,
            Expr::Unary(op, child) => op.apply(self.evaluate_expr(node, child)?),
            Expr::Binary(op, left, right) => op.apply(
                self.evaluate_expr(node, left)?,
                self.evaluate_expr(node, right)?,
            ),
        })
    }
}
