// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Node protocols: sources, transformations and datasets
//!
//! Sources are leaves that run on their own thread and push tables into
//! their downstream consumers. Every internal node is a pair of a
//! [`Transformation`], which consumes tables from its parents, and a
//! [`Dataset`], which the transformation writes its output into and which
//! forwards tables and signals to the node's own consumers.

use crate::exec::error::{ExecutionError, Result};
use crate::exec::run_context::RunContext;
use crate::exec::table::{GroupKey, Table};
use crate::exec::time::Time;
use crate::exec::trigger::TriggerSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Metadata reported by a source after it ran
pub type Metadata = BTreeMap<String, Vec<serde_json::Value>>;

/// Identifier of one node replica, unique within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId(Uuid);

impl DatasetId {
    /// Derive the id of replica `replica` of plan node `node_id`.
    ///
    /// The same pair always yields the same id.
    pub fn from_node_id(node_id: &str, replica: usize) -> Self {
        let name = format!("{}/{}", node_id, replica);
        DatasetId(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a dataset keeps after a buffered table has been emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulationMode {
    /// Drop the buffered rows once emitted
    #[default]
    Discarding,
    /// Keep the buffered rows and emit them again on later firings
    Accumulating,
}

/// Consumer side of an edge.
///
/// `id` identifies the producer replica the call comes from. A consumer
/// with several parents must tolerate calls interleaved across parents; it
/// is finished once every parent called [`Transformation::finish`].
pub trait Transformation: Send {
    fn process(&mut self, id: DatasetId, table: Table) -> Result<()>;

    fn retract_table(&mut self, id: DatasetId, key: &GroupKey) -> Result<()>;

    fn update_watermark(&mut self, id: DatasetId, mark: Time) -> Result<()>;

    fn update_processing_time(&mut self, id: DatasetId, time: Time) -> Result<()>;

    fn finish(&mut self, id: DatasetId, err: Option<ExecutionError>);

    /// Short name used in log messages
    fn label(&self) -> &str {
        "transformation"
    }
}

/// Leaf node that produces tables on its own execution thread
pub trait Source: Send {
    fn add_transformation(&mut self, t: Box<dyn Transformation>);

    /// Drive the source to completion. Must return promptly once `ctx` is done.
    fn run(&mut self, ctx: &RunContext);

    fn set_label(&mut self, label: String);

    fn label(&self) -> &str;

    /// Metadata gathered while running, read once after `run` returns
    fn metadata(&self) -> Option<Metadata> {
        None
    }
}

/// Output sink of a transformation.
///
/// Datasets are shared handles: the executor keeps one to attach consumers
/// while the owning transformation writes into another.
pub trait Dataset: Send + Sync {
    fn id(&self) -> DatasetId;

    fn add_transformation(&self, t: Box<dyn Transformation>);

    fn set_trigger_spec(&self, spec: TriggerSpec);

    fn retract_table(&self, key: &GroupKey) -> Result<()>;

    fn update_watermark(&self, mark: Time) -> Result<()>;

    fn update_processing_time(&self, time: Time) -> Result<()>;

    /// Flush what is left (unless `err` is set) and finish every consumer
    fn finish(&self, err: Option<ExecutionError>);

    /// Datasets that want the run context expose it here
    fn as_context_aware(&self) -> Option<&dyn DatasetContext> {
        None
    }
}

/// Capability of datasets that observe the run context
pub trait DatasetContext {
    fn with_context(&self, ctx: RunContext);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_id_is_deterministic() {
        assert_eq!(
            DatasetId::from_node_id("filter0", 1),
            DatasetId::from_node_id("filter0", 1)
        );
        assert_ne!(
            DatasetId::from_node_id("filter0", 0),
            DatasetId::from_node_id("filter0", 1)
        );
        assert_ne!(
            DatasetId::from_node_id("a", 11),
            DatasetId::from_node_id("a1", 1)
        );
    }
}
