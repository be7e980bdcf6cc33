// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Tables, group keys and the builders operators accumulate rows into

use crate::exec::error::{ErrorCode, ExecutionError, Result};
use crate::exec::memory::{Allocator, MemoryReservation};
use crate::exec::time::Time;
use crate::exec::trigger::Trigger;
use crate::exec::value::{ColMeta, ColType, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Label of the column holding the upper bound of a table's time window
pub const DEFAULT_STOP_COL_LABEL: &str = "_stop";
/// Label of the column holding the lower bound of a table's time window
pub const DEFAULT_START_COL_LABEL: &str = "_start";

/// The set of columns (and their values) shared by every row of a table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct GroupKey {
    cols: Vec<ColMeta>,
    values: Vec<Value>,
}

impl GroupKey {
    pub fn new(cols: Vec<ColMeta>, values: Vec<Value>) -> Result<Self> {
        if cols.len() != values.len() {
            return Err(ExecutionError::Internal(format!(
                "group key has {} columns but {} values",
                cols.len(),
                values.len()
            )));
        }
        for (col, value) in cols.iter().zip(&values) {
            value.check_type(col.col_type)?;
        }
        Ok(Self { cols, values })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn cols(&self) -> &[ColMeta] {
        &self.cols
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn has_col(&self, label: &str) -> bool {
        self.cols.iter().any(|c| c.label == label)
    }

    pub fn value(&self, label: &str) -> Option<&Value> {
        self.cols
            .iter()
            .position(|c| c.label == label)
            .map(|i| &self.values[i])
    }

    /// Time value of a key column, if present and of type time
    pub fn value_time(&self, label: &str) -> Option<Time> {
        self.value(label).and_then(Value::as_time)
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (col, value)) in self.cols.iter().zip(&self.values).enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", col.label, value)?;
        }
        f.write_str("}")
    }
}

struct TableData {
    key: GroupKey,
    cols: Vec<ColMeta>,
    columns: Vec<Vec<Value>>,
    len: usize,
    // Released when the last clone of the table is dropped.
    _reservation: Option<MemoryReservation>,
}

/// An immutable, column-major table.
///
/// Clones share the underlying storage.
#[derive(Clone)]
pub struct Table {
    data: Arc<TableData>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("key", &self.data.key)
            .field("cols", &self.data.cols)
            .field("len", &self.data.len)
            .finish()
    }
}

impl Table {
    /// Build an unaccounted table from column-major values
    pub fn new(key: GroupKey, cols: Vec<ColMeta>, columns: Vec<Vec<Value>>) -> Result<Self> {
        Self::assemble(key, cols, columns, None)
    }

    fn assemble(
        key: GroupKey,
        cols: Vec<ColMeta>,
        columns: Vec<Vec<Value>>,
        reservation: Option<MemoryReservation>,
    ) -> Result<Self> {
        if cols.len() != columns.len() {
            return Err(ExecutionError::Internal(format!(
                "table has {} columns but {} value vectors",
                cols.len(),
                columns.len()
            )));
        }
        let len = columns.first().map(Vec::len).unwrap_or(0);
        if columns.iter().any(|c| c.len() != len) {
            return Err(ExecutionError::Internal(
                "table columns have different lengths".to_string(),
            ));
        }
        Ok(Self {
            data: Arc::new(TableData {
                key,
                cols,
                columns,
                len,
                _reservation: reservation,
            }),
        })
    }

    /// Build a table from rows, accounting its size on `alloc`
    pub fn from_rows(
        key: GroupKey,
        cols: Vec<ColMeta>,
        rows: Vec<Vec<Value>>,
        alloc: &Allocator,
    ) -> Result<Self> {
        let mut builder = TableBuilder::new(key, alloc);
        for col in cols {
            builder.add_col(col)?;
        }
        for row in &rows {
            builder.append_row(row)?;
        }
        Ok(builder.take_table())
    }

    pub fn key(&self) -> &GroupKey {
        &self.data.key
    }

    pub fn cols(&self) -> &[ColMeta] {
        &self.data.cols
    }

    pub fn len(&self) -> usize {
        self.data.len
    }

    pub fn is_empty(&self) -> bool {
        self.data.len == 0
    }

    pub fn col_idx(&self, label: &str) -> Option<usize> {
        self.data.cols.iter().position(|c| c.label == label)
    }

    pub fn column(&self, j: usize) -> &[Value] {
        &self.data.columns[j]
    }

    pub fn value(&self, row: usize, col: usize) -> &Value {
        &self.data.columns[col][row]
    }

    /// Materialize row `i`
    pub fn row(&self, i: usize) -> Vec<Value> {
        self.data.columns.iter().map(|c| c[i].clone()).collect()
    }

    pub fn rows(&self) -> impl Iterator<Item = Vec<Value>> + '_ {
        (0..self.len()).map(move |i| self.row(i))
    }
}

/// Incrementally builds a table for one group key.
///
/// Every appended value is accounted on the allocator.
pub struct TableBuilder {
    key: GroupKey,
    cols: Vec<ColMeta>,
    columns: Vec<Vec<Value>>,
    reservation: MemoryReservation,
}

impl fmt::Debug for TableBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableBuilder")
            .field("key", &self.key)
            .field("cols", &self.cols)
            .field("rows", &self.n_rows())
            .finish()
    }
}

impl TableBuilder {
    pub fn new(key: GroupKey, alloc: &Allocator) -> Self {
        Self {
            key,
            cols: Vec::new(),
            columns: Vec::new(),
            reservation: MemoryReservation::empty(alloc),
        }
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn cols(&self) -> &[ColMeta] {
        &self.cols
    }

    pub fn n_rows(&self) -> usize {
        self.columns.first().map(Vec::len).unwrap_or(0)
    }

    pub fn col_idx(&self, label: &str) -> Option<usize> {
        self.cols.iter().position(|c| c.label == label)
    }

    /// Add a column and return its index. Existing rows are padded with nulls.
    pub fn add_col(&mut self, col: ColMeta) -> Result<usize> {
        if self.col_idx(&col.label).is_some() {
            return Err(ExecutionError::operator(
                ErrorCode::Invalid,
                format!("table builder already has column {:?}", col.label),
            ));
        }
        let rows = self.n_rows();
        self.reservation.grow(rows)?;
        self.cols.push(col);
        self.columns.push(vec![Value::Null; rows]);
        Ok(self.cols.len() - 1)
    }

    /// Add every column of `cols` that the builder does not have yet
    pub fn ensure_cols(&mut self, cols: &[ColMeta]) -> Result<()> {
        for col in cols {
            match self.col_idx(&col.label) {
                Some(j) if self.cols[j].col_type != col.col_type => {
                    return Err(ExecutionError::operator(
                        ErrorCode::FailedPrecondition,
                        format!(
                            "schema collision on column {:?}: {} vs {}",
                            col.label, self.cols[j].col_type, col.col_type
                        ),
                    ));
                }
                Some(_) => {}
                None => {
                    self.add_col(col.clone())?;
                }
            }
        }
        Ok(())
    }

    pub fn append_value(&mut self, j: usize, value: Value) -> Result<()> {
        let col = self.cols.get(j).ok_or_else(|| {
            ExecutionError::Internal(format!("builder column index {} out of bounds", j))
        })?;
        value.check_type(col.col_type)?;
        self.reservation.grow(value.byte_size())?;
        self.columns[j].push(value);
        Ok(())
    }

    /// Append one full row, in column order
    pub fn append_row(&mut self, row: &[Value]) -> Result<()> {
        if row.len() != self.cols.len() {
            return Err(ExecutionError::Internal(format!(
                "row has {} values but builder has {} columns",
                row.len(),
                self.cols.len()
            )));
        }
        for (j, value) in row.iter().enumerate() {
            self.append_value(j, value.clone())?;
        }
        Ok(())
    }

    /// Append row `i` of `table`, matching columns by label. Columns missing
    /// from the table receive nulls.
    pub fn append_table_row(&mut self, table: &Table, i: usize) -> Result<()> {
        for j in 0..self.cols.len() {
            let value = match table.col_idx(&self.cols[j].label) {
                Some(src) => table.value(i, src).clone(),
                None => Value::Null,
            };
            self.append_value(j, value)?;
        }
        Ok(())
    }

    /// Drop all rows but keep the schema
    pub fn clear_data(&mut self) {
        for column in &mut self.columns {
            column.clear();
        }
        let alloc = self.reservation.alloc().clone();
        self.reservation = MemoryReservation::empty(&alloc);
    }

    /// Build a table holding a copy of the buffered rows, accounted separately
    pub fn table(&self) -> Result<Table> {
        let bytes = self.reservation.size();
        let reservation = self.reservation.alloc().reserve(bytes)?;
        Table::assemble(
            self.key.clone(),
            self.cols.clone(),
            self.columns.clone(),
            Some(reservation),
        )
    }

    /// Move the buffered rows into a table, leaving the builder empty with
    /// the same schema
    pub fn take_table(&mut self) -> Table {
        let columns = self
            .columns
            .iter_mut()
            .map(std::mem::take)
            .collect::<Vec<_>>();
        let alloc = self.reservation.alloc().clone();
        let reservation = std::mem::replace(&mut self.reservation, MemoryReservation::empty(&alloc));
        Table {
            data: Arc::new(TableData {
                key: self.key.clone(),
                cols: self.cols.clone(),
                len: columns.first().map(Vec::len).unwrap_or(0),
                columns,
                _reservation: Some(reservation),
            }),
        }
    }
}

struct CacheEntry {
    seq: u64,
    builder: TableBuilder,
    trigger: Option<Trigger>,
}

/// Table builders keyed by group key, iterated in insertion order
pub struct TableBuilderCache {
    alloc: Allocator,
    entries: HashMap<GroupKey, CacheEntry>,
    next_seq: u64,
}

impl fmt::Debug for TableBuilderCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableBuilderCache")
            .field("tables", &self.entries.len())
            .finish()
    }
}

impl TableBuilderCache {
    pub fn new(alloc: Allocator) -> Self {
        Self {
            alloc,
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn allocator(&self) -> &Allocator {
        &self.alloc
    }

    /// Get the builder for `key`, creating it if needed. The flag reports
    /// whether the builder was created by this call.
    pub fn table_builder(&mut self, key: &GroupKey) -> (&mut TableBuilder, bool) {
        let mut created = false;
        let alloc = &self.alloc;
        let next_seq = &mut self.next_seq;
        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            created = true;
            *next_seq += 1;
            CacheEntry {
                seq: *next_seq,
                builder: TableBuilder::new(key.clone(), alloc),
                trigger: None,
            }
        });
        (&mut entry.builder, created)
    }

    pub fn get(&self, key: &GroupKey) -> Option<&TableBuilder> {
        self.entries.get(key).map(|e| &e.builder)
    }

    pub fn get_mut(&mut self, key: &GroupKey) -> Option<&mut TableBuilder> {
        self.entries.get_mut(key).map(|e| &mut e.builder)
    }

    pub fn trigger_mut(&mut self, key: &GroupKey) -> Option<&mut Option<Trigger>> {
        self.entries.get_mut(key).map(|e| &mut e.trigger)
    }

    /// Drop the buffered rows of a table, keeping its builder
    pub fn discard_table(&mut self, key: &GroupKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.builder.clear_data();
        }
    }

    /// Remove a table and its builder entirely
    pub fn expire_table(&mut self, key: &GroupKey) {
        self.entries.remove(key);
    }

    /// Keys in the order their builders were created
    pub fn keys(&self) -> Vec<GroupKey> {
        let mut keys: Vec<(u64, &GroupKey)> =
            self.entries.iter().map(|(k, e)| (e.seq, k)).collect();
        keys.sort_by_key(|(seq, _)| *seq);
        keys.into_iter().map(|(_, k)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Append the group key columns of `key` to the builder
pub fn add_table_key_cols(key: &GroupKey, builder: &mut TableBuilder) -> Result<()> {
    for col in key.cols() {
        builder.add_col(col.clone())?;
    }
    Ok(())
}

/// Append the group key values to their columns in the builder
pub fn append_key_values(key: &GroupKey, builder: &mut TableBuilder) -> Result<()> {
    for (col, value) in key.cols().iter().zip(key.values()) {
        let j = builder.col_idx(&col.label).ok_or_else(|| {
            ExecutionError::Internal(format!("builder is missing key column {:?}", col.label))
        })?;
        builder.append_value(j, value.clone())?;
    }
    Ok(())
}

/// Convenience for building a single-column-typed key in tests and sources
pub fn group_key_of(pairs: &[(&str, Value)]) -> Result<GroupKey> {
    let mut cols = Vec::with_capacity(pairs.len());
    let mut values = Vec::with_capacity(pairs.len());
    for (label, value) in pairs {
        let col_type = value.col_type().unwrap_or(ColType::String);
        cols.push(ColMeta::new(*label, col_type));
        values.push(value.clone());
    }
    GroupKey::new(cols, values)
}
