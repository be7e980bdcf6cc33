// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! `merge` transformation: fan-in of parallel replicas

use crate::exec::context::ExecutionContext;
use crate::exec::dataset::PassthroughDataset;
use crate::exec::error::{ExecutionError, Result};
use crate::exec::node::{AccumulationMode, Dataset, DatasetId, Transformation};
use crate::exec::parents::ParentStates;
use crate::exec::registry::{Registration, TransformationPair};
use crate::exec::table::{GroupKey, Table};
use crate::exec::time::Time;
use crate::operators::invalid_spec;
use crate::plan::procedure::{ProcedureKind, ProcedureSpec};
use std::sync::Arc;

pub(crate) fn registration() -> Registration {
    Registration::Transformation(ProcedureKind::Merge, Arc::new(create_merge))
}

fn create_merge(
    id: DatasetId,
    _mode: AccumulationMode,
    spec: &ProcedureSpec,
    ec: &ExecutionContext,
) -> Result<TransformationPair> {
    if !matches!(spec, ProcedureSpec::Merge(_)) {
        return Err(invalid_spec(ProcedureKind::Merge, spec));
    }
    let d = PassthroughDataset::new(id);
    let t = MergeTransformation::new(d.clone(), ec.parents());
    Ok((Box::new(t), Arc::new(d)))
}

/// Forwards tables from every parent and finishes after the last one
pub struct MergeTransformation {
    d: PassthroughDataset,
    parents: ParentStates,
}

impl MergeTransformation {
    pub fn new(d: PassthroughDataset, parents: &[DatasetId]) -> Self {
        Self {
            d,
            parents: ParentStates::new(parents),
        }
    }
}

impl Transformation for MergeTransformation {
    fn process(&mut self, _id: DatasetId, table: Table) -> Result<()> {
        self.d.process(table)
    }

    fn retract_table(&mut self, _id: DatasetId, key: &GroupKey) -> Result<()> {
        self.d.retract_table(key)
    }

    fn update_watermark(&mut self, id: DatasetId, mark: Time) -> Result<()> {
        match self.parents.update_watermark(id, mark) {
            Some(mark) => self.d.update_watermark(mark),
            None => Ok(()),
        }
    }

    fn update_processing_time(&mut self, id: DatasetId, time: Time) -> Result<()> {
        match self.parents.update_processing_time(id, time) {
            Some(time) => self.d.update_processing_time(time),
            None => Ok(()),
        }
    }

    fn finish(&mut self, id: DatasetId, err: Option<ExecutionError>) {
        if let Some(err) = self.parents.finish(id, err) {
            self.d.finish(err);
        }
    }

    fn label(&self) -> &str {
        "merge"
    }
}
