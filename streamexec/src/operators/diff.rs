// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! `diff` transformation: compares the tables of two parents
//!
//! The first parent provides the wanted tables, the second the tables to
//! check. Tables are paired by group key. A pair that differs produces one
//! output table holding the key columns, a `_diff` marker column and the
//! union of the value columns: `-` rows come from the wanted table, `+` rows
//! from the other one. Tables without a partner are compared against an
//! empty table once the other parent finished.

use crate::exec::context::ExecutionContext;
use crate::exec::dataset::TableDataset;
use crate::exec::error::{ErrorCode, ExecutionError, Result};
use crate::exec::node::{AccumulationMode, Dataset, DatasetId, Transformation};
use crate::exec::parents::ParentStates;
use crate::exec::registry::{Registration, TransformationPair};
use crate::exec::table::{add_table_key_cols, append_key_values, GroupKey, Table, TableBuilderCache};
use crate::exec::time::Time;
use crate::exec::value::{ColMeta, ColType, Value};
use crate::operators::invalid_spec;
use crate::plan::procedure::{DiffSpec, ProcedureKind, ProcedureSpec};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Label of the marker column
pub const DIFF_COL_LABEL: &str = "_diff";

pub(crate) fn registration() -> Registration {
    Registration::Transformation(ProcedureKind::Diff, Arc::new(create_diff))
}

fn create_diff(
    id: DatasetId,
    mode: AccumulationMode,
    spec: &ProcedureSpec,
    ec: &ExecutionContext,
) -> Result<TransformationPair> {
    let ProcedureSpec::Diff(spec) = spec else {
        return Err(invalid_spec(ProcedureKind::Diff, spec));
    };
    let parents = ec.parents();
    if parents.len() != 2 {
        return Err(ExecutionError::operator(
            ErrorCode::Internal,
            "diff should have exactly 2 parents",
        ));
    }
    let cache = TableBuilderCache::new(ec.allocator().clone());
    let d = TableDataset::new(id, mode, cache);
    let t = DiffTransformation::new(d.clone(), spec, parents[0], parents[1]);
    Ok((Box::new(t), Arc::new(d)))
}

/// Value columns of one side of a comparison
struct Side<'a> {
    table: Option<&'a Table>,
    cols: BTreeMap<&'a str, (ColType, usize)>,
}

impl<'a> Side<'a> {
    fn new(table: Option<&'a Table>) -> Self {
        let mut cols = BTreeMap::new();
        if let Some(t) = table {
            for (j, col) in t.cols().iter().enumerate() {
                if !t.key().has_col(&col.label) {
                    cols.insert(col.label.as_str(), (col.col_type, j));
                }
            }
        }
        Self { table, cols }
    }

    fn len(&self) -> usize {
        self.table.map(Table::len).unwrap_or(0)
    }

    fn value(&self, label: &str, i: usize) -> Value {
        match (self.table, self.cols.get(label)) {
            (Some(t), Some((_, j))) => t.value(i, *j).clone(),
            _ => Value::Null,
        }
    }
}

pub struct DiffTransformation {
    d: TableDataset,
    want_id: DatasetId,
    got_id: DatasetId,
    parents: ParentStates,
    /// Tables waiting for their partner, in arrival order
    pending: Vec<(DatasetId, Table)>,
    epsilon: f64,
    nans_equal: bool,
}

impl DiffTransformation {
    pub fn new(d: TableDataset, spec: &DiffSpec, want_id: DatasetId, got_id: DatasetId) -> Self {
        Self {
            d,
            want_id,
            got_id,
            parents: ParentStates::new(&[want_id, got_id]),
            pending: Vec::new(),
            epsilon: spec.epsilon,
            nans_equal: spec.nans_equal,
        }
    }

    fn diff(&self, key: &GroupKey, want: Option<&Table>, got: Option<&Table>) -> Result<()> {
        let want = Side::new(want);
        let got = Side::new(got);

        let sz = want.len().min(got.len());
        let mut i = 0;
        if want.len() == got.len() {
            while i < sz && self.row_equal(&want, &got, i) {
                i += 1;
            }
            if i == sz {
                return Ok(());
            }
        }

        let mut cache = self.d.cache();
        let (builder, created) = cache.table_builder(key);
        if !created {
            return Err(ExecutionError::operator(
                ErrorCode::FailedPrecondition,
                "duplicate table key",
            ));
        }

        // Key columns, the marker, then every value column by label.
        add_table_key_cols(key, builder)?;
        let diff_idx = builder.add_col(ColMeta::new(DIFF_COL_LABEL, ColType::String))?;
        let mut col_types = BTreeMap::new();
        for (label, (typ, _)) in &want.cols {
            col_types.insert(*label, *typ);
        }
        for (label, (typ, _)) in &got.cols {
            match col_types.get(label) {
                Some(existing) if existing != typ => {
                    return Err(ExecutionError::operator(
                        ErrorCode::FailedPrecondition,
                        format!("column types differ: want={} got={}", existing, typ),
                    ));
                }
                Some(_) => {}
                None => {
                    col_types.insert(*label, *typ);
                }
            }
        }
        let mut col_map = Vec::with_capacity(col_types.len());
        for (label, typ) in col_types {
            col_map.push((label, builder.add_col(ColMeta::new(label, typ))?));
        }

        let mut append = |marker: &str, side: &Side<'_>, i: usize| -> Result<()> {
            append_key_values(key, builder)?;
            builder.append_value(diff_idx, Value::String(marker.to_string()))?;
            for (label, j) in &col_map {
                builder.append_value(*j, side.value(label, i))?;
            }
            Ok(())
        };

        while i < sz {
            if !self.row_equal(&want, &got, i) {
                append("-", &want, i)?;
                append("+", &got, i)?;
            }
            i += 1;
        }
        for i in sz..want.len() {
            append("-", &want, i)?;
        }
        for i in sz..got.len() {
            append("+", &got, i)?;
        }
        Ok(())
    }

    fn row_equal(&self, want: &Side<'_>, got: &Side<'_>, i: usize) -> bool {
        if want.cols.len() != got.cols.len() {
            return false;
        }
        for label in want.cols.keys() {
            if !got.cols.contains_key(label) {
                return false;
            }
            let (w, g) = (want.value(label, i), got.value(label, i));
            let equal = match (&w, &g) {
                (Value::Null, Value::Null) => true,
                (Value::Null, _) | (_, Value::Null) => false,
                (Value::Float(a), Value::Float(b)) => {
                    (self.nans_equal && a.is_nan() && b.is_nan()) || (a - b).abs() <= self.epsilon
                }
                (a, b) => a == b,
            };
            if !equal {
                return false;
            }
        }
        true
    }

    fn other(&self, id: DatasetId) -> DatasetId {
        if id == self.want_id {
            self.got_id
        } else {
            self.want_id
        }
    }

    fn pair(&self, id: DatasetId, table: &Table, partner: Option<&Table>) -> Result<()> {
        if id == self.want_id {
            self.diff(table.key(), Some(table), partner)
        } else {
            self.diff(table.key(), partner, Some(table))
        }
    }

    /// Compare every table still waiting for a partner against nothing
    fn flush_pending(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for (id, table) in &pending {
            self.pair(*id, table, None)?;
        }
        Ok(())
    }
}

impl Transformation for DiffTransformation {
    fn process(&mut self, id: DatasetId, table: Table) -> Result<()> {
        // Nothing is compared once a parent failed.
        if self.parents.err().is_some() {
            return Ok(());
        }
        let other = self.other(id);
        let found = self
            .pending
            .iter()
            .position(|(pid, t)| *pid == other && t.key() == table.key());
        match found {
            Some(idx) => {
                let (_, partner) = self.pending.remove(idx);
                self.pair(id, &table, Some(&partner))
            }
            None if self.parents.is_finished(other) => self.pair(id, &table, None),
            None => {
                if self
                    .pending
                    .iter()
                    .any(|(pid, t)| *pid == id && t.key() == table.key())
                {
                    return Err(ExecutionError::operator(
                        ErrorCode::FailedPrecondition,
                        "duplicate table key",
                    ));
                }
                self.pending.push((id, table));
                Ok(())
            }
        }
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
        let Some(err) = self.parents.finish(id, err) else {
            return;
        };
        let err = match err {
            Some(err) => {
                self.pending.clear();
                Some(err)
            }
            None => self.flush_pending().err(),
        };
        self.d.finish(err);
    }

    fn label(&self) -> &str {
        "diff"
    }
}
