// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::fmt::{Display, Error as FmtError, Formatter};
use std::sync::Arc;

use crate::eval::Evaluator;
use crate::metric::{MetricDescriptor, MetricId, MetricValue};
use crate::store::{CctMetricStore, NodeMetrics};
use crate::Result;

/// Final values of every metric for a set of nodes, evaluated once sampling
/// has stopped.
pub struct Report {
    pub metrics: Vec<Arc<MetricDescriptor>>,
    pub nodes: Vec<NodeReport>,
}

pub struct NodeReport {
    pub label: String,
    pub values: Vec<MetricValue>,
}

impl Report {
    pub fn value(&self, label: &str, id: MetricId) -> Option<MetricValue> {
        self.nodes
            .iter()
            .find(|node| node.label == label)
            .and_then(|node| node.values.get(id.index()).copied())
    }
}

pub struct ReportBuilder<'a> {
    store: &'a CctMetricStore,
    nodes: Vec<(String, &'a NodeMetrics)>,
}

impl<'a> ReportBuilder<'a> {
    pub fn new(store: &'a CctMetricStore) -> Self {
        Self {
            store,
            nodes: Vec::new(),
        }
    }

    pub fn node(mut self, label: impl Into<String>, node: &'a NodeMetrics) -> Self {
        self.nodes.push((label.into(), node));
        self
    }

    pub fn build(&self) -> Result<Report> {
        let evaluator = Evaluator::new(self.store);
        let nodes = self
            .nodes
            .iter()
            .map(|(label, node)| {
                if node.dropped() > 0 {
                    log::warn!("{}: {} deliveries were dropped", label, node.dropped());
                }
                Ok(NodeReport {
                    label: label.clone(),
                    values: evaluator.evaluate_all(node)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Report {
            metrics: self.store.registry().iter().collect(),
            nodes,
        })
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter) -> std::result::Result<(), FmtError> {
        for node in self.nodes.iter() {
            writeln!(f, "{}", node.label)?;
            for (metric, value) in self.metrics.iter().zip(node.values.iter()) {
                writeln!(f, "  {} = {}", metric, value)?;
            }
        }

        Ok(())
    }
}
