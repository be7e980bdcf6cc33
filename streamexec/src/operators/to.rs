// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! `to` transformation: writes tables to a named in-memory destination
//!
//! Destinations live in a process-wide store so their content outlives the
//! execution that wrote it. Stored tables are copies that are not accounted
//! on the execution's allocator.

use crate::exec::context::ExecutionContext;
use crate::exec::dataset::PassthroughDataset;
use crate::exec::error::{ExecutionError, Result};
use crate::exec::node::{AccumulationMode, Dataset, DatasetId, Transformation};
use crate::exec::parents::ParentStates;
use crate::exec::registry::{Registration, TransformationPair};
use crate::exec::table::{GroupKey, Table};
use crate::exec::time::Time;
use crate::operators::invalid_spec;
use crate::plan::procedure::{ProcedureKind, ProcedureSpec, ToSpec};
use log::debug;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

static DESTINATIONS: Lazy<Mutex<HashMap<String, Vec<Table>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Tables written to `destination` so far
pub fn destination_tables(destination: &str) -> Vec<Table> {
    DESTINATIONS
        .lock()
        .get(destination)
        .cloned()
        .unwrap_or_default()
}

/// Remove and return the tables written to `destination`
pub fn take_destination(destination: &str) -> Vec<Table> {
    DESTINATIONS.lock().remove(destination).unwrap_or_default()
}

/// Drop every destination
pub fn clear_destinations() {
    DESTINATIONS.lock().clear();
}

fn store(destination: &str, table: &Table) -> Result<()> {
    let columns = (0..table.cols().len())
        .map(|j| table.column(j).to_vec())
        .collect();
    let copy = Table::new(table.key().clone(), table.cols().to_vec(), columns)?;
    DESTINATIONS
        .lock()
        .entry(destination.to_string())
        .or_default()
        .push(copy);
    Ok(())
}

pub(crate) fn registration() -> Registration {
    Registration::Transformation(ProcedureKind::To, Arc::new(create_to))
}

fn create_to(
    id: DatasetId,
    _mode: AccumulationMode,
    spec: &ProcedureSpec,
    ec: &ExecutionContext,
) -> Result<TransformationPair> {
    let ProcedureSpec::To(spec) = spec else {
        return Err(invalid_spec(ProcedureKind::To, spec));
    };
    let d = PassthroughDataset::new(id);
    let t = ToTransformation::new(d.clone(), spec, ec.parents());
    Ok((Box::new(t), Arc::new(d)))
}

/// Stores every table and passes it on unchanged
pub struct ToTransformation {
    d: PassthroughDataset,
    destination: String,
    parents: ParentStates,
    written: usize,
}

impl ToTransformation {
    pub fn new(d: PassthroughDataset, spec: &ToSpec, parents: &[DatasetId]) -> Self {
        Self {
            d,
            destination: spec.destination.clone(),
            parents: ParentStates::new(parents),
            written: 0,
        }
    }
}

impl Transformation for ToTransformation {
    fn process(&mut self, _id: DatasetId, table: Table) -> Result<()> {
        store(&self.destination, &table)?;
        self.written += 1;
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
            debug!("wrote {} tables to {:?}", self.written, self.destination);
            self.d.finish(err);
        }
    }

    fn label(&self) -> &str {
        "to"
    }
}
