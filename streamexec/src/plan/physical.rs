// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Physical query plan representation
//!
//! A physical plan is a DAG of procedure nodes. Edges point from a producer to
//! its consumer and carry the input slot of the consumer, so the predecessors
//! of a node keep their declaration order. The nodes without successors are
//! the roots of the plan.

use crate::exec::error::{ExecutionError, Result};
use crate::exec::time::{Bounds, Time};
use crate::exec::trigger::TriggerSpec;
use crate::plan::procedure::{ProcedureKind, ProcedureSpec};
use chrono::{DateTime, Utc};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A point in time as written in a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTime {
    /// Fixed timestamp
    Absolute(DateTime<Utc>),
    /// Nanoseconds relative to the plan's `now`
    Relative(i64),
}

impl PlanTime {
    pub fn resolve(&self, now: DateTime<Utc>) -> Time {
        match self {
            PlanTime::Absolute(t) => Time::from_datetime(t),
            PlanTime::Relative(nanos) => Time::from_datetime(&now).saturating_add(*nanos),
        }
    }
}

/// Time window attached to a plan node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanBounds {
    pub start: PlanTime,
    pub stop: PlanTime,
}

impl PlanBounds {
    pub fn resolve(&self, now: DateTime<Utc>) -> Bounds {
        Bounds::new(self.start.resolve(now), self.stop.resolve(now))
    }
}

/// Run-scoped quotas. Zero means "choose a default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceManagement {
    pub memory_bytes_quota: i64,
    pub concurrency_quota: usize,
}

/// Node of a physical plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    pub spec: ProcedureSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<PlanBounds>,
    /// Number of parallel replicas of this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_run: Option<usize>,
    /// Number of predecessor replicas merged into this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_merge: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerSpec>,
}

impl PlanNode {
    pub fn new(id: impl Into<String>, spec: ProcedureSpec) -> Self {
        Self {
            id: id.into(),
            spec,
            bounds: None,
            parallel_run: None,
            parallel_merge: None,
            trigger: None,
        }
    }

    pub fn with_bounds(mut self, bounds: PlanBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_parallel_run(mut self, factor: usize) -> Self {
        self.parallel_run = Some(factor);
        self
    }

    pub fn with_parallel_merge(mut self, factor: usize) -> Self {
        self.parallel_merge = Some(factor);
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerSpec) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn kind(&self) -> ProcedureKind {
        self.spec.kind()
    }

    pub fn is_yield(&self) -> bool {
        self.kind() == ProcedureKind::Yield
    }
}

/// Physical plan: a DAG of [`PlanNode`]s plus run-scoped settings
#[derive(Debug, Clone)]
pub struct PhysicalPlan {
    graph: DiGraph<PlanNode, usize>,
    ids: HashMap<String, NodeIndex>,
    pub resources: ResourceManagement,
    /// Base timestamp relative plan times are resolved against
    pub now: DateTime<Utc>,
}

impl Default for PhysicalPlan {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl PhysicalPlan {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            graph: DiGraph::new(),
            ids: HashMap::new(),
            resources: ResourceManagement::default(),
            now,
        }
    }

    pub fn with_resources(mut self, resources: ResourceManagement) -> Self {
        self.resources = resources;
        self
    }

    /// Add a node. Node ids must be unique within the plan.
    pub fn add_node(&mut self, node: PlanNode) -> Result<NodeIndex> {
        if self.ids.contains_key(&node.id) {
            return Err(ExecutionError::InvalidPlan(format!(
                "duplicate plan node id {:?}",
                node.id
            )));
        }
        let id = node.id.clone();
        let idx = self.graph.add_node(node);
        self.ids.insert(id, idx);
        Ok(idx)
    }

    /// Connect `from` as the next predecessor of `to`
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        let from = self.index_of(from)?;
        let to = self.index_of(to)?;
        let slot = self.graph.edges_directed(to, Direction::Incoming).count();
        self.graph.add_edge(from, to, slot);
        Ok(())
    }

    pub fn index_of(&self, id: &str) -> Result<NodeIndex> {
        self.ids
            .get(id)
            .copied()
            .ok_or_else(|| ExecutionError::InvalidPlan(format!("unknown plan node {:?}", id)))
    }

    pub fn node(&self, idx: NodeIndex) -> &PlanNode {
        &self.graph[idx]
    }

    pub fn node_by_id(&self, id: &str) -> Option<&PlanNode> {
        self.ids.get(id).map(|idx| &self.graph[*idx])
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Node indices in insertion order
    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Predecessors of `idx` in input slot order
    pub fn predecessors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut edges: Vec<(usize, NodeIndex)> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| (*e.weight(), e.source()))
            .collect();
        edges.sort_by_key(|(slot, _)| *slot);
        edges.into_iter().map(|(_, n)| n).collect()
    }

    pub fn successors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut succ: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        succ.sort();
        succ.dedup();
        succ
    }

    /// Terminal nodes, in insertion order
    pub fn roots(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|idx| {
                self.graph
                    .neighbors_directed(*idx, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .collect()
    }

    /// Leaf nodes, in insertion order
    pub fn sources(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|idx| {
                self.graph
                    .neighbors_directed(*idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    /// Follow yield nodes up to the node producing their data
    pub fn skip_yields(&self, mut idx: NodeIndex) -> Result<NodeIndex> {
        while self.graph[idx].is_yield() {
            idx = *self.predecessors(idx).first().ok_or_else(|| {
                ExecutionError::InvalidPlan(format!(
                    "yield {:?} has no predecessor",
                    self.graph[idx].id
                ))
            })?;
        }
        Ok(idx)
    }

    /// Predecessors of `idx` with yields resolved to their producers
    pub fn non_yield_predecessors(&self, idx: NodeIndex) -> Result<Vec<NodeIndex>> {
        self.predecessors(idx)
            .into_iter()
            .map(|p| self.skip_yields(p))
            .collect()
    }

    /// Check the structural rules the executor relies on
    pub fn validate(&self) -> Result<()> {
        if is_cyclic_directed(&self.graph) {
            return Err(ExecutionError::InvalidPlan("plan contains a cycle".into()));
        }
        for idx in self.graph.node_indices() {
            let node = &self.graph[idx];
            let preds = self.predecessors(idx).len();
            if node.is_yield() && preds != 1 {
                return Err(ExecutionError::InvalidPlan(format!(
                    "yield {:?} must have exactly one predecessor, has {}",
                    node.id, preds
                )));
            }
            if node.parallel_run == Some(0) || node.parallel_merge == Some(0) {
                return Err(ExecutionError::InvalidPlan(format!(
                    "node {:?} has a zero parallel factor",
                    node.id
                )));
            }
            let copies = node.parallel_run.unwrap_or(1);
            let pred_copies = node.parallel_merge.unwrap_or(1);
            if copies > 1 && pred_copies > 1 {
                return Err(ExecutionError::InvalidPlan(format!(
                    "node {:?} cannot both run in parallel and merge parallel input",
                    node.id
                )));
            }
        }
        Ok(())
    }

    /// Visit every node after all of its predecessors.
    ///
    /// The order is a depth-first post-order from the roots, with
    /// predecessors visited in input slot order, so it is deterministic.
    pub fn bottom_up_walk<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(NodeIndex, &PlanNode) -> Result<()>,
    {
        for idx in self.bottom_up_order() {
            f(idx, &self.graph[idx])?;
        }
        Ok(())
    }

    /// Visit every node before any of its predecessors
    pub fn top_down_walk<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(NodeIndex, &PlanNode) -> Result<()>,
    {
        for idx in self.bottom_up_order().into_iter().rev() {
            f(idx, &self.graph[idx])?;
        }
        Ok(())
    }

    fn bottom_up_order(&self) -> Vec<NodeIndex> {
        let mut order = Vec::with_capacity(self.len());
        let mut visited = HashSet::new();
        for root in self.roots() {
            // Explicit stack: (node, predecessors already pushed)
            let mut stack = vec![(root, false)];
            while let Some((idx, expanded)) = stack.pop() {
                if expanded {
                    order.push(idx);
                    continue;
                }
                if !visited.insert(idx) {
                    continue;
                }
                stack.push((idx, true));
                for pred in self.predecessors(idx).into_iter().rev() {
                    if !visited.contains(&pred) {
                        stack.push((pred, false));
                    }
                }
            }
        }
        order
    }
}
