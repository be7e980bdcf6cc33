// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! JSON documents describing physical plans

use crate::exec::error::{ExecutionError, Result};
use crate::plan::physical::{PhysicalPlan, PlanNode, ResourceManagement};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Plan node together with the ids of its predecessors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDocument {
    #[serde(flatten)]
    pub node: PlanNode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predecessors: Vec<String>,
}

/// Serialized form of a [`PhysicalPlan`]
///
/// ```json
/// {
///   "now": "2024-01-01T00:00:00Z",
///   "resources": { "concurrency_quota": 2 },
///   "nodes": [
///     { "id": "from0", "spec": { "kind": "from", "tables": [] } },
///     { "id": "out", "spec": { "kind": "yield", "name": "out" },
///       "predecessors": ["from0"] }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDocument {
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resources: ResourceManagement,
    pub nodes: Vec<NodeDocument>,
}

impl PlanDocument {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ExecutionError::InvalidPlan(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ExecutionError::Internal(format!("cannot serialize plan: {}", e)))
    }

    /// Build and validate the plan. A missing `now` resolves to the current time.
    pub fn into_plan(self) -> Result<PhysicalPlan> {
        let mut plan = PhysicalPlan::new(self.now.unwrap_or_else(Utc::now))
            .with_resources(self.resources);
        let mut edges = Vec::new();
        for doc in self.nodes {
            for pred in &doc.predecessors {
                edges.push((pred.clone(), doc.node.id.clone()));
            }
            plan.add_node(doc.node)?;
        }
        for (from, to) in edges {
            plan.add_edge(&from, &to)?;
        }
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_plan(plan: &PhysicalPlan) -> Self {
        let nodes = plan
            .node_indices()
            .map(|idx| NodeDocument {
                node: plan.node(idx).clone(),
                predecessors: plan
                    .predecessors(idx)
                    .into_iter()
                    .map(|p| plan.node(p).id.clone())
                    .collect(),
            })
            .collect();
        Self {
            now: Some(plan.now),
            resources: plan.resources,
            nodes,
        }
    }
}

impl PhysicalPlan {
    /// Parse and validate a plan from its JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        PlanDocument::from_json(json)?.into_plan()
    }
}
