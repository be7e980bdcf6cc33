// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Plan fixtures
//!
//! Builders for the small plans the integration tests run, and a helper
//! that executes a plan and waits for every result and the metadata channel.

use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use streamexec::exec::{ColMeta, ColType, Metadata};
use streamexec::plan::{
    CompareOp, FilterSpec, FromSpec, LimitSpec, MergeSpec, PhysicalPlan, PlanNode, Predicate,
    ProcedureSpec, TableSpec, ToSpec, YieldSpec,
};
use streamexec::{read_results, Allocator, Executor, Result, RunContext, Table, Value};

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One table keyed by `host` with a float `_value` column
pub fn host_table(host: &str, values: &[f64]) -> TableSpec {
    TableSpec {
        key: vec!["host".into()],
        columns: vec![
            ColMeta::new("host", ColType::String),
            ColMeta::new("_value", ColType::Float),
        ],
        rows: values.iter().map(|v| vec![json!(host), json!(v)]).collect(),
    }
}

pub fn from_node(id: &str, tables: Vec<TableSpec>) -> PlanNode {
    PlanNode::new(id, ProcedureSpec::From(FromSpec { tables }))
}

/// Filter keeping rows whose `_value` is greater than `threshold`
pub fn filter_gt(id: &str, threshold: f64) -> PlanNode {
    PlanNode::new(
        id,
        ProcedureSpec::Filter(FilterSpec {
            predicate: Predicate::Compare {
                column: "_value".into(),
                cmp: CompareOp::Gt,
                value: json!(threshold),
            },
            keep_empty_tables: false,
        }),
    )
}

pub fn limit_node(id: &str, n: usize) -> PlanNode {
    PlanNode::new(id, ProcedureSpec::Limit(LimitSpec { n, offset: 0 }))
}

pub fn merge_node(id: &str) -> PlanNode {
    PlanNode::new(id, ProcedureSpec::Merge(MergeSpec {}))
}

pub fn to_node(id: &str, destination: &str) -> PlanNode {
    PlanNode::new(
        id,
        ProcedureSpec::To(ToSpec {
            destination: destination.into(),
        }),
    )
}

pub fn yield_node(id: &str, name: &str) -> PlanNode {
    PlanNode::new(id, ProcedureSpec::Yield(YieldSpec { name: name.into() }))
}

/// Build a linear plan, each node feeding the next one
pub fn chain(nodes: Vec<PlanNode>) -> PhysicalPlan {
    let mut plan = PhysicalPlan::default();
    let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
    for node in nodes {
        plan.add_node(node).expect("Failed to add node");
    }
    for pair in ids.windows(2) {
        plan.add_edge(&pair[0], &pair[1]).expect("Failed to add edge");
    }
    plan
}

/// `from -> filter(_value > 1.5) -> yield("out")` over one table of three rows
pub fn filter_plan() -> PhysicalPlan {
    chain(vec![
        from_node("from0", vec![host_table("a", &[1.0, 2.0, 3.0])]),
        filter_gt("filter0", 1.5),
        yield_node("yield0", "out"),
    ])
}

/// Everything a finished run produced
pub struct RunOutput {
    pub results: BTreeMap<String, Result<Vec<Table>>>,
    pub metadata: Vec<Metadata>,
}

impl RunOutput {
    pub fn tables(&self, name: &str) -> &[Table] {
        match self.results.get(name) {
            Some(Ok(tables)) => tables,
            Some(Err(e)) => panic!("result {:?} failed: {}", name, e),
            None => panic!("no result named {:?}", name),
        }
    }

    pub fn error(&self, name: &str) -> streamexec::ExecutionError {
        match self.results.get(name) {
            Some(Err(e)) => e.clone(),
            Some(Ok(tables)) => panic!("result {:?} succeeded with {} tables", name, tables.len()),
            None => panic!("no result named {:?}", name),
        }
    }
}

/// Execute `plan` and wait until the run is over
pub fn run_plan(
    executor: &Executor,
    ctx: &RunContext,
    plan: &PhysicalPlan,
    alloc: Option<Allocator>,
) -> Result<RunOutput> {
    let (results, meta) = executor.execute(ctx, plan, alloc)?;
    let results = read_results(results);
    // The channel closes once every execution thread exited.
    let metadata = meta.iter().collect();
    Ok(RunOutput { results, metadata })
}

/// Values of column `label` over every row of `tables`
pub fn column_values(tables: &[Table], label: &str) -> Vec<Value> {
    tables
        .iter()
        .flat_map(|t| {
            let j = t
                .col_idx(label)
                .unwrap_or_else(|| panic!("no column {:?}", label));
            t.column(j).to_vec()
        })
        .collect()
}

pub fn floats(values: &[f64]) -> Vec<Value> {
    values.iter().map(|v| Value::Float(*v)).collect()
}
