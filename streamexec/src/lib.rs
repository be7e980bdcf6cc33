// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! StreamExec - execution core for dataflow query plans
//!
//! StreamExec runs physical query plans: directed acyclic graphs of sources
//! and transformations that exchange tables of rows grouped by key.
//!
//! # Features
//!
//! - **Bounded concurrency**: transformations run on a fixed worker pool
//! - **Parallel replicas**: nodes can be split and merged again
//! - **Watermarks and triggers**: buffered tables are emitted by trigger
//! - **Memory quotas**: every buffer is accounted against a shared allocator
//! - **Abort and cancellation**: the first failure fails every result
//!
//! # Usage
//!
//! ```ignore
//! use streamexec::{Executor, ExecutorConfig, PhysicalPlan, RunContext};
//!
//! let plan = PhysicalPlan::from_json(&std::fs::read_to_string("plan.json")?)?;
//! let executor = Executor::new(ExecutorConfig::default());
//! let (results, metadata) = executor.execute(&RunContext::background(), &plan, None)?;
//! for (name, tables) in streamexec::read_results(results) {
//!     println!("{}: {} tables", name, tables?.len());
//! }
//! ```

pub mod exec;
pub mod operators;
pub mod plan;

pub use exec::{
    read_results, Allocator, ErrorCode, ExecutionError, Executor, ExecutorConfig, Metadata,
    QueryResult, Result, Results, RunContext, Table, Value,
};
pub use plan::{PhysicalPlan, PlanDocument, PlanNode, ProcedureSpec};

/// StreamExec version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// StreamExec crate name
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
