// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! `quantile` transformation
//!
//! Computes one quantile per table. `exact_mean` interpolates between the
//! two closest values, `exact_selector` outputs the row holding the selected
//! value and `estimate` aggregates into a sketch of bounded size. Sketches
//! are recycled through a free list and accounted on the allocator.

use crate::exec::context::ExecutionContext;
use crate::exec::dataset::TableDataset;
use crate::exec::error::{ErrorCode, ExecutionError, Result};
use crate::exec::memory::Allocator;
use crate::exec::node::{AccumulationMode, Dataset, DatasetId, Transformation};
use crate::exec::parents::ParentStates;
use crate::exec::registry::{Registration, TransformationPair};
use crate::exec::table::{add_table_key_cols, append_key_values, GroupKey, Table, TableBuilderCache};
use crate::exec::time::Time;
use crate::exec::value::{ColMeta, ColType, Value};
use crate::operators::invalid_spec;
use crate::plan::procedure::{ProcedureKind, ProcedureSpec, QuantileMethod, QuantileSpec};
use std::cmp::Ordering;
use std::sync::Arc;

/// Bytes of one centroid
const CENTROID_SIZE: usize = 2 * std::mem::size_of::<f64>();

pub(crate) fn registration() -> Registration {
    Registration::Transformation(ProcedureKind::Quantile, Arc::new(create_quantile))
}

fn create_quantile(
    id: DatasetId,
    mode: AccumulationMode,
    spec: &ProcedureSpec,
    ec: &ExecutionContext,
) -> Result<TransformationPair> {
    let ProcedureSpec::Quantile(spec) = spec else {
        return Err(invalid_spec(ProcedureKind::Quantile, spec));
    };
    let cache = TableBuilderCache::new(ec.allocator().clone());
    let d = TableDataset::new(id, mode, cache);
    let t = QuantileTransformation::new(d.clone(), spec, ec.parents(), ec.allocator().clone())?;
    Ok((Box::new(t), Arc::new(d)))
}

/// Linear interpolation over sorted values at position `q * (n - 1)`
fn interpolate(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let x = q * (sorted.len() - 1) as f64;
    let (x0, x1) = (x.floor(), x.ceil());
    let (y0, y1) = (sorted[x0 as usize], sorted[x1 as usize]);
    if x0 == x1 {
        return Some(y0);
    }
    Some(y0 * (x1 - x) + y1 * (x - x0))
}

/// Index of the selected row among `n` sorted rows
fn selector_index(q: f64, n: usize) -> usize {
    let index = (q * n as f64).ceil() as usize;
    index.saturating_sub(1)
}

/// Mergeable summary holding at most `capacity` weighted centroids
#[derive(Debug, Clone)]
pub struct Sketch {
    centroids: Vec<(f64, f64)>,
    capacity: usize,
}

impl Sketch {
    fn new(compression: f64) -> Self {
        Self {
            centroids: Vec::new(),
            capacity: Self::capacity_for(compression),
        }
    }

    fn capacity_for(compression: f64) -> usize {
        (compression.ceil() as usize).max(2)
    }

    /// Accounted size of a sketch built for `compression`
    pub fn byte_size(compression: f64) -> usize {
        Self::capacity_for(compression) * CENTROID_SIZE
    }

    fn add(&mut self, x: f64) {
        self.centroids.push((x, 1.0));
        if self.centroids.len() > self.capacity {
            self.compress();
        }
    }

    /// Merge the closest neighbours until the sketch fits again
    fn compress(&mut self) {
        self.centroids
            .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        while self.centroids.len() > self.capacity {
            let mut best = 0;
            let mut best_gap = f64::INFINITY;
            for i in 0..self.centroids.len() - 1 {
                let gap = self.centroids[i + 1].0 - self.centroids[i].0;
                if gap < best_gap {
                    best_gap = gap;
                    best = i;
                }
            }
            let (m1, w1) = self.centroids[best];
            let (m2, w2) = self.centroids.remove(best + 1);
            let w = w1 + w2;
            self.centroids[best] = ((m1 * w1 + m2 * w2) / w, w);
        }
    }

    fn reset(&mut self) {
        self.centroids.clear();
    }

    fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    /// Treats every centroid as `weight` copies of its mean. Exact while
    /// the sketch never had to compress.
    fn quantile(&mut self, q: f64) -> Option<f64> {
        if self.centroids.is_empty() {
            return None;
        }
        self.centroids
            .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        let total: f64 = self.centroids.iter().map(|c| c.1).sum();
        let x = q * (total - 1.0);
        let at = |pos: f64| {
            let mut seen = 0.0;
            for (mean, weight) in &self.centroids {
                seen += weight;
                if pos < seen {
                    return *mean;
                }
            }
            self.centroids[self.centroids.len() - 1].0
        };
        let (x0, x1) = (x.floor(), x.ceil());
        let (y0, y1) = (at(x0), at(x1));
        if x0 == x1 {
            return Some(y0);
        }
        Some(y0 * (x1 - x) + y1 * (x - x0))
    }
}

/// Hands out sketches, keeping up to `size` released ones for reuse.
///
/// Every live or pooled sketch is accounted on the allocator; dropping one
/// from a full pool and closing the aggregate give the bytes back.
pub struct QuantileAgg {
    quantile: f64,
    compression: f64,
    free: Vec<Sketch>,
    size: usize,
    alloc: Allocator,
}

impl QuantileAgg {
    pub fn new(quantile: f64, compression: f64, alloc: Allocator, size: usize) -> Self {
        Self {
            quantile,
            compression,
            free: Vec::with_capacity(size),
            size,
            alloc,
        }
    }

    fn sketch_size(&self) -> usize {
        Sketch::byte_size(self.compression)
    }

    pub fn new_sketch(&mut self) -> Result<Sketch> {
        match self.free.pop() {
            Some(sketch) => Ok(sketch),
            None => {
                self.alloc.allocate(self.sketch_size())?;
                Ok(Sketch::new(self.compression))
            }
        }
    }

    pub fn release(&mut self, mut sketch: Sketch) {
        if self.free.len() < self.size {
            sketch.reset();
            self.free.push(sketch);
        } else {
            self.alloc.free(self.sketch_size());
        }
    }

    pub fn value(&self, sketch: &mut Sketch) -> Option<f64> {
        sketch.quantile(self.quantile)
    }

    /// Give back every pooled sketch
    pub fn close(&mut self) {
        for _ in self.free.drain(..) {
            self.alloc.free(Sketch::byte_size(self.compression));
        }
    }
}

impl Drop for QuantileAgg {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct QuantileTransformation {
    d: TableDataset,
    quantile: f64,
    method: QuantileMethod,
    column: String,
    agg: QuantileAgg,
    parents: ParentStates,
}

impl QuantileTransformation {
    pub fn new(
        d: TableDataset,
        spec: &QuantileSpec,
        parents: &[DatasetId],
        alloc: Allocator,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&spec.quantile) {
            return Err(ExecutionError::operator(
                ErrorCode::Invalid,
                format!("quantile must be between 0 and 1, got {}", spec.quantile),
            ));
        }
        Ok(Self {
            d,
            quantile: spec.quantile,
            method: spec.method,
            column: spec.column.clone(),
            agg: QuantileAgg::new(spec.quantile, spec.compression, alloc, 1),
            parents: ParentStates::new(parents),
        })
    }

    fn value_col(&self, table: &Table) -> Result<usize> {
        table.col_idx(&self.column).ok_or_else(|| {
            ExecutionError::operator(
                ErrorCode::FailedPrecondition,
                format!("no column {:?} exists", self.column),
            )
        })
    }

    fn numeric_values(&self, table: &Table, j: usize) -> Result<Vec<f64>> {
        match table.cols()[j].col_type {
            ColType::Int | ColType::UInt | ColType::Float => {
                Ok(table.column(j).iter().filter_map(Value::as_f64).collect())
            }
            other => Err(ExecutionError::operator(
                ErrorCode::FailedPrecondition,
                format!("unsupported aggregate column type {}", other),
            )),
        }
    }

    fn aggregate(&mut self, table: &Table, j: usize) -> Result<Option<f64>> {
        let values = self.numeric_values(table, j)?;
        match self.method {
            QuantileMethod::ExactMean => {
                let mut sorted = values;
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
                Ok(interpolate(&sorted, self.quantile))
            }
            QuantileMethod::Estimate => {
                let mut sketch = self.agg.new_sketch()?;
                for v in values {
                    sketch.add(v);
                }
                let value = if sketch.is_empty() {
                    None
                } else {
                    self.agg.value(&mut sketch)
                };
                self.agg.release(sketch);
                Ok(value)
            }
            QuantileMethod::ExactSelector => Err(ExecutionError::Internal(
                "selector quantiles are not aggregates".to_string(),
            )),
        }
    }

    /// Output table: key columns followed by the quantile of the value column
    fn process_aggregate(&mut self, table: &Table, j: usize) -> Result<()> {
        let value = self.aggregate(table, j)?;
        let mut cache = self.d.cache();
        let (builder, created) = cache.table_builder(table.key());
        if !created {
            return Err(duplicate_table(table.key()));
        }
        add_table_key_cols(table.key(), builder)?;
        let vj = builder.add_col(ColMeta::new(self.column.as_str(), ColType::Float))?;
        append_key_values(table.key(), builder)?;
        builder.append_value(vj, value.map(Value::Float).unwrap_or(Value::Null))
    }

    /// Output table: the input schema with the selected row, or the key
    /// values and nulls if no row holds a value
    fn process_selector(&mut self, table: &Table, j: usize) -> Result<()> {
        let mut rows: Vec<usize> = (0..table.len())
            .filter(|i| !table.value(*i, j).is_null())
            .collect();
        rows.sort_by(|a, b| {
            table
                .value(*a, j)
                .compare(table.value(*b, j))
                .unwrap_or(Ordering::Equal)
        });
        let selected = if rows.is_empty() {
            None
        } else {
            Some(rows[selector_index(self.quantile, rows.len())])
        };

        let mut cache = self.d.cache();
        let (builder, created) = cache.table_builder(table.key());
        if !created {
            return Err(duplicate_table(table.key()));
        }
        builder.ensure_cols(table.cols())?;
        match selected {
            Some(i) => builder.append_table_row(table, i),
            None => {
                for (c, col) in table.cols().iter().enumerate() {
                    let value = table.key().value(&col.label).cloned().unwrap_or(Value::Null);
                    builder.append_value(c, value)?;
                }
                Ok(())
            }
        }
    }
}

fn duplicate_table(key: &GroupKey) -> ExecutionError {
    ExecutionError::operator(
        ErrorCode::FailedPrecondition,
        format!("found duplicate table with key: {}", key),
    )
}

impl Transformation for QuantileTransformation {
    fn process(&mut self, _id: DatasetId, table: Table) -> Result<()> {
        let j = self.value_col(&table)?;
        match self.method {
            QuantileMethod::ExactSelector => self.process_selector(&table, j),
            QuantileMethod::ExactMean | QuantileMethod::Estimate => {
                self.process_aggregate(&table, j)
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
        if let Some(err) = self.parents.finish(id, err) {
            self.agg.close();
            self.d.finish(err);
        }
    }

    fn label(&self) -> &str {
        "quantile"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::dataset::tests::Collector;
    use crate::exec::table::group_key_of;

    #[test]
    fn test_interpolation() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(interpolate(&sorted, 0.0), Some(1.0));
        assert_eq!(interpolate(&sorted, 1.0), Some(4.0));
        assert_eq!(interpolate(&sorted, 0.5), Some(2.5));
        assert_eq!(interpolate(&[], 0.5), None);
    }

    #[test]
    fn test_selector_index() {
        assert_eq!(selector_index(0.0, 4), 0);
        assert_eq!(selector_index(0.5, 4), 1);
        assert_eq!(selector_index(0.51, 4), 2);
        assert_eq!(selector_index(1.0, 4), 3);
    }

    #[test]
    fn test_sketch_is_exact_below_capacity() {
        let mut sketch = Sketch::new(100.0);
        for v in [5.0, 1.0, 3.0, 2.0, 4.0] {
            sketch.add(v);
        }
        assert_eq!(sketch.quantile(0.5), Some(3.0));
        assert_eq!(sketch.quantile(0.25), Some(2.0));
    }

    #[test]
    fn test_sketch_stays_bounded() {
        let mut sketch = Sketch::new(10.0);
        for v in 0..1000 {
            sketch.add(v as f64);
        }
        assert!(sketch.centroids.len() <= 10);
        let total: f64 = sketch.centroids.iter().map(|c| c.1).sum();
        assert_eq!(total, 1000.0);
        let low = sketch.quantile(0.1).unwrap();
        let high = sketch.quantile(0.9).unwrap();
        assert!(low <= high);
        assert!((0.0..=999.0).contains(&low) && (0.0..=999.0).contains(&high));
    }

    #[test]
    fn test_free_list_accounting_is_symmetric() {
        let alloc = Allocator::unlimited();
        let size = Sketch::byte_size(10.0) as i64;
        let mut agg = QuantileAgg::new(0.5, 10.0, alloc.clone(), 1);

        let a = agg.new_sketch().unwrap();
        let b = agg.new_sketch().unwrap();
        assert_eq!(alloc.allocated(), 2 * size);

        agg.release(a);
        // The pool is full, so this one is given back right away.
        agg.release(b);
        assert_eq!(alloc.allocated(), size);

        let c = agg.new_sketch().unwrap();
        assert_eq!(alloc.allocated(), size);
        agg.release(c);
        agg.close();
        assert_eq!(alloc.allocated(), 0);
    }

    fn run(method: QuantileMethod, quantile: f64, values: &[Option<f64>]) -> (Vec<Table>, Allocator) {
        let alloc = Allocator::unlimited();
        let parent = DatasetId::from_node_id("from0", 0);
        let d = TableDataset::new(
            DatasetId::from_node_id("quantile0", 0),
            AccumulationMode::Discarding,
            TableBuilderCache::new(alloc.clone()),
        );
        let sink = Collector::default();
        d.add_transformation(Box::new(sink.clone()));
        let spec = QuantileSpec {
            quantile,
            method,
            column: "_value".into(),
            compression: 100.0,
        };
        let mut t = QuantileTransformation::new(d, &spec, &[parent], alloc.clone()).unwrap();
        let key = group_key_of(&[("host", Value::String("a".into()))]).unwrap();
        let table = Table::from_rows(
            key,
            vec![
                ColMeta::new("host", ColType::String),
                ColMeta::new("_value", ColType::Float),
                ColMeta::new("tag", ColType::Int),
            ],
            values
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    vec![
                        Value::String("a".into()),
                        v.map(Value::Float).unwrap_or(Value::Null),
                        Value::Int(i as i64),
                    ]
                })
                .collect(),
            &alloc,
        )
        .unwrap();
        t.process(parent, table).unwrap();
        t.finish(parent, None);
        (sink.tables(), alloc)
    }

    #[test]
    fn test_exact_mean() {
        let (tables, _) = run(
            QuantileMethod::ExactMean,
            0.5,
            &[Some(4.0), None, Some(1.0), Some(3.0), Some(2.0)],
        );
        assert_eq!(tables.len(), 1);
        let labels: Vec<&str> = tables[0].cols().iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["host", "_value"]);
        assert_eq!(tables[0].value(0, 1), &Value::Float(2.5));
    }

    #[test]
    fn test_exact_selector_outputs_row() {
        let (tables, _) = run(
            QuantileMethod::ExactSelector,
            0.5,
            &[Some(4.0), None, Some(1.0), Some(3.0), Some(2.0)],
        );
        assert_eq!(tables[0].len(), 1);
        assert_eq!(tables[0].value(0, 1), &Value::Float(2.0));
        assert_eq!(tables[0].value(0, 2), &Value::Int(4));
    }

    #[test]
    fn test_selector_without_values() {
        let (tables, _) = run(QuantileMethod::ExactSelector, 0.5, &[None, None]);
        assert_eq!(
            tables[0].row(0),
            vec![Value::String("a".into()), Value::Null, Value::Null]
        );
    }

    #[test]
    fn test_estimate_releases_memory() {
        let (tables, alloc) = run(
            QuantileMethod::Estimate,
            1.0,
            &[Some(4.0), Some(1.0), Some(3.0)],
        );
        assert_eq!(tables[0].value(0, 1), &Value::Float(4.0));
        drop(tables);
        assert_eq!(alloc.allocated(), 0);
    }

    #[test]
    fn test_missing_column() {
        let alloc = Allocator::unlimited();
        let d = TableDataset::new(
            DatasetId::from_node_id("q", 0),
            AccumulationMode::Discarding,
            TableBuilderCache::new(alloc.clone()),
        );
        let spec = QuantileSpec {
            quantile: 0.5,
            method: QuantileMethod::ExactMean,
            column: "missing".into(),
            compression: 100.0,
        };
        let mut t = QuantileTransformation::new(d, &spec, &[], alloc).unwrap();
        let err = t
            .process(
                DatasetId::from_node_id("p", 0),
                Table::new(GroupKey::empty(), vec![], vec![]).unwrap(),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    }
}
