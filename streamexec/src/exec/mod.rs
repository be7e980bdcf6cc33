// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Execution engine
//!
//! This module turns physical plans into running node graphs: sources on
//! their own threads, transformations driven by a bounded worker pool, and
//! named results read by the caller.

pub mod config;
pub mod context;
pub mod dataset;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod memory;
pub mod node;
pub mod parents;
pub mod registry;
pub mod result;
pub mod run_context;
pub mod table;
pub mod time;
pub mod transport;
pub mod trigger;
pub mod value;

// Re-export the main types for convenience
pub use config::{ExecutionOptions, ExecutorConfig};
pub use context::{ExecutionContext, ParallelOpts, StreamContext};
pub use dataset::{PassthroughDataset, TableDataset};
pub use error::{ErrorCode, ExecutionError, Result};
pub use executor::{read_results, Executor, Results};
pub use memory::{Allocator, MemoryStats};
pub use node::{AccumulationMode, Dataset, DatasetId, Metadata, Source, Transformation};
pub use parents::ParentStates;
pub use registry::{default_registry, Registration, Registry};
pub use result::{QueryResult, ResultSink};
pub use run_context::RunContext;
pub use table::{GroupKey, Table, TableBuilder, TableBuilderCache};
pub use time::{Bounds, Time};
pub use trigger::{Trigger, TriggerSpec};
pub use value::{ColMeta, ColType, Value};
