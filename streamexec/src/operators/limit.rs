// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! `limit` transformation: keeps at most `n` rows per table after skipping
//! `offset` rows

use crate::exec::context::ExecutionContext;
use crate::exec::dataset::PassthroughDataset;
use crate::exec::error::{ExecutionError, Result};
use crate::exec::memory::Allocator;
use crate::exec::node::{AccumulationMode, Dataset, DatasetId, Transformation};
use crate::exec::parents::ParentStates;
use crate::exec::registry::{Registration, TransformationPair};
use crate::exec::table::{GroupKey, Table, TableBuilder};
use crate::exec::time::Time;
use crate::operators::invalid_spec;
use crate::plan::procedure::{LimitSpec, ProcedureKind, ProcedureSpec};
use std::sync::Arc;

pub(crate) fn registration() -> Registration {
    Registration::Transformation(ProcedureKind::Limit, Arc::new(create_limit))
}

fn create_limit(
    id: DatasetId,
    _mode: AccumulationMode,
    spec: &ProcedureSpec,
    ec: &ExecutionContext,
) -> Result<TransformationPair> {
    let ProcedureSpec::Limit(spec) = spec else {
        return Err(invalid_spec(ProcedureKind::Limit, spec));
    };
    let d = PassthroughDataset::new(id);
    let t = LimitTransformation::new(d.clone(), spec, ec.parents(), ec.allocator().clone());
    Ok((Box::new(t), Arc::new(d)))
}

/// Stateless per-table limit; tables are forwarded as soon as they arrive
pub struct LimitTransformation {
    d: PassthroughDataset,
    n: usize,
    offset: usize,
    parents: ParentStates,
    alloc: Allocator,
}

impl LimitTransformation {
    pub fn new(d: PassthroughDataset, spec: &LimitSpec, parents: &[DatasetId], alloc: Allocator) -> Self {
        Self {
            d,
            n: spec.n,
            offset: spec.offset,
            parents: ParentStates::new(parents),
            alloc,
        }
    }

    fn limit_table(&self, table: &Table) -> Result<Table> {
        let start = self.offset.min(table.len());
        let stop = start.saturating_add(self.n).min(table.len());
        if start == 0 && stop == table.len() {
            return Ok(table.clone());
        }

        let mut builder = TableBuilder::new(table.key().clone(), &self.alloc);
        builder.ensure_cols(table.cols())?;
        for i in start..stop {
            builder.append_table_row(table, i)?;
        }
        Ok(builder.take_table())
    }
}

impl Transformation for LimitTransformation {
    fn process(&mut self, _id: DatasetId, table: Table) -> Result<()> {
        let limited = self.limit_table(&table)?;
        drop(table);
        self.d.process(limited)
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
        "limit"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::dataset::tests::Collector;
    use crate::exec::value::{ColMeta, ColType, Value};

    fn table(alloc: &Allocator, n: i64) -> Table {
        Table::from_rows(
            GroupKey::empty(),
            vec![ColMeta::new("_value", ColType::Int)],
            (0..n).map(|v| vec![Value::Int(v)]).collect(),
            alloc,
        )
        .unwrap()
    }

    fn limit(n: usize, offset: usize, rows: i64) -> Vec<Value> {
        let alloc = Allocator::unlimited();
        let parent = DatasetId::from_node_id("from0", 0);
        let d = PassthroughDataset::new(DatasetId::from_node_id("limit0", 0));
        let sink = Collector::default();
        d.add_transformation(Box::new(sink.clone()));
        let mut t = LimitTransformation::new(d, &LimitSpec { n, offset }, &[parent], alloc.clone());
        t.process(parent, table(&alloc, rows)).unwrap();
        t.finish(parent, None);

        let tables = sink.tables();
        assert_eq!(tables.len(), 1);
        assert_eq!(sink.finished(), Some(None));
        tables[0].column(0).to_vec()
    }

    #[test]
    fn test_limit_and_offset() {
        assert_eq!(limit(2, 0, 5), vec![Value::Int(0), Value::Int(1)]);
        assert_eq!(limit(2, 3, 5), vec![Value::Int(3), Value::Int(4)]);
        assert_eq!(limit(10, 4, 5), vec![Value::Int(4)]);
    }

    #[test]
    fn test_offset_past_end_emits_empty_table() {
        assert!(limit(3, 9, 5).is_empty());
        assert!(limit(0, 0, 5).is_empty());
    }

    #[test]
    fn test_memory_released_with_tables() {
        let alloc = Allocator::unlimited();
        let parent = DatasetId::from_node_id("from0", 0);
        let d = PassthroughDataset::new(DatasetId::from_node_id("limit0", 0));
        let mut t = LimitTransformation::new(
            d,
            &LimitSpec { n: 1, offset: 1 },
            &[parent],
            alloc.clone(),
        );
        t.process(parent, table(&alloc, 4)).unwrap();
        t.finish(parent, None);
        assert_eq!(alloc.allocated(), 0);
    }
}
