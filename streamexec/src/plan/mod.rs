// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Physical plan model consumed by the executor

pub mod document;
pub mod physical;
pub mod procedure;

pub use document::{NodeDocument, PlanDocument};
pub use physical::{PhysicalPlan, PlanBounds, PlanNode, PlanTime, ResourceManagement};
pub use procedure::{
    CompareOp, DiffSpec, FilterSpec, FromSpec, LimitSpec, MergeSpec, Predicate, ProcedureKind,
    ProcedureSpec, QuantileMethod, QuantileSpec, TableSpec, ToSpec, YieldSpec,
    DEFAULT_VALUE_COL_LABEL, DEFAULT_YIELD_NAME,
};
