// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Per-replica execution context handed to operator constructors

use crate::exec::memory::Allocator;
use crate::exec::node::DatasetId;
use crate::exec::run_context::RunContext;
use crate::exec::time::{Bounds, Time};
use crate::plan::physical::PlanTime;
use chrono::{DateTime, Utc};

/// Time bounds a replica operates within, if the plan set any
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamContext {
    bounds: Option<Bounds>,
}

impl StreamContext {
    pub fn new(bounds: Option<Bounds>) -> Self {
        Self { bounds }
    }

    pub fn bounds(&self) -> Option<&Bounds> {
        self.bounds.as_ref()
    }
}

/// Which of `factor` parallel replicas a node instance is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelOpts {
    pub group: usize,
    pub factor: usize,
}

impl Default for ParallelOpts {
    fn default() -> Self {
        Self {
            group: 0,
            factor: 1,
        }
    }
}

/// Everything an operator constructor learns about the replica it builds
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Shared run context, cancelled when the execution aborts
    ctx: RunContext,
    /// Upstream replicas, in predecessor order then replica order
    parents: Vec<DatasetId>,
    stream: StreamContext,
    parallel: ParallelOpts,
    alloc: Allocator,
    now: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(
        ctx: RunContext,
        parents: Vec<DatasetId>,
        stream: StreamContext,
        parallel: ParallelOpts,
        alloc: Allocator,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            ctx,
            parents,
            stream,
            parallel,
            alloc,
            now,
        }
    }

    /// Context for exercising an operator outside of an execution
    pub fn standalone(parents: Vec<DatasetId>) -> Self {
        Self::new(
            RunContext::background(),
            parents,
            StreamContext::default(),
            ParallelOpts::default(),
            Allocator::unlimited(),
            Utc::now(),
        )
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn parents(&self) -> &[DatasetId] {
        &self.parents
    }

    pub fn stream_context(&self) -> &StreamContext {
        &self.stream
    }

    pub fn parallel_opts(&self) -> ParallelOpts {
        self.parallel
    }

    pub fn allocator(&self) -> &Allocator {
        &self.alloc
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn resolve_time(&self, t: &PlanTime) -> Time {
        t.resolve(self.now)
    }
}
