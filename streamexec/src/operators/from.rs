// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! `from` source: emits literal tables declared in the plan

use crate::exec::context::ExecutionContext;
use crate::exec::error::{ExecutionError, Result};
use crate::exec::memory::Allocator;
use crate::exec::node::{DatasetId, Metadata, Source, Transformation};
use crate::exec::registry::Registration;
use crate::exec::run_context::RunContext;
use crate::exec::table::{GroupKey, Table};
use crate::exec::time::{Bounds, Time};
use crate::exec::value::{ColMeta, Value};
use crate::operators::invalid_spec;
use crate::plan::procedure::{ProcedureKind, ProcedureSpec, TableSpec};
use log::debug;
use std::sync::Arc;

pub(crate) fn registration() -> Registration {
    Registration::Source(ProcedureKind::From, Arc::new(create_from_source))
}

fn create_from_source(
    spec: &ProcedureSpec,
    id: DatasetId,
    ec: &ExecutionContext,
) -> Result<Box<dyn Source>> {
    let ProcedureSpec::From(spec) = spec else {
        return Err(invalid_spec(ProcedureKind::From, spec));
    };
    let opts = ec.parallel_opts();
    // Replicas split the tables round-robin.
    let tables = spec
        .tables
        .iter()
        .enumerate()
        .filter(|(i, _)| i % opts.factor.max(1) == opts.group)
        .map(|(_, t)| t.clone())
        .collect();
    let bounds = ec.stream_context().bounds().copied();
    Ok(Box::new(FromSource::new(
        id,
        tables,
        bounds,
        ec.allocator().clone(),
    )))
}

/// Source replaying in-memory tables
pub struct FromSource {
    id: DatasetId,
    label: String,
    tables: Vec<TableSpec>,
    bounds: Option<Bounds>,
    alloc: Allocator,
    ts: Vec<Box<dyn Transformation>>,
    rows_emitted: usize,
    tables_emitted: usize,
}

impl FromSource {
    pub fn new(
        id: DatasetId,
        tables: Vec<TableSpec>,
        bounds: Option<Bounds>,
        alloc: Allocator,
    ) -> Self {
        Self {
            id,
            label: "from".to_string(),
            tables,
            bounds,
            alloc,
            ts: Vec::new(),
            rows_emitted: 0,
            tables_emitted: 0,
        }
    }

    fn emit_all(&mut self, ctx: &RunContext) -> Result<()> {
        let specs = std::mem::take(&mut self.tables);
        for spec in &specs {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            let table = build_table(spec, &self.alloc)?;
            let rows = table.len();
            for t in self.ts.iter_mut() {
                t.process(self.id, table.clone())?;
            }
            self.rows_emitted += rows;
            self.tables_emitted += 1;
        }

        let mark = self.bounds.map(|b| b.stop).unwrap_or(Time::MAX);
        for t in self.ts.iter_mut() {
            t.update_watermark(self.id, mark)?;
        }
        Ok(())
    }
}

/// Build a table from its literal spec. Key values are read from the first
/// row and every other row must repeat them; a table without rows gets null
/// key values.
fn build_table(spec: &TableSpec, alloc: &Allocator) -> Result<Table> {
    let mut key_idx = Vec::with_capacity(spec.key.len());
    let mut key_cols = Vec::with_capacity(spec.key.len());
    let mut key_values = Vec::with_capacity(spec.key.len());
    for label in &spec.key {
        let j = spec
            .columns
            .iter()
            .position(|c| &c.label == label)
            .ok_or_else(|| {
                ExecutionError::InvalidPlan(format!("key column {:?} is not a table column", label))
            })?;
        let col: &ColMeta = &spec.columns[j];
        let value = match spec.rows.first() {
            Some(row) => match row.get(j) {
                Some(json) => Value::from_json(json, col.col_type)?,
                None => Value::Null,
            },
            None => Value::Null,
        };
        key_idx.push(j);
        key_cols.push(col.clone());
        key_values.push(value);
    }

    let mut rows = Vec::with_capacity(spec.rows.len());
    for (i, row) in spec.rows.iter().enumerate() {
        if row.len() != spec.columns.len() {
            return Err(ExecutionError::InvalidPlan(format!(
                "row {} has {} values but the table has {} columns",
                i,
                row.len(),
                spec.columns.len()
            )));
        }
        let values = row
            .iter()
            .zip(&spec.columns)
            .map(|(json, col)| Value::from_json(json, col.col_type))
            .collect::<Result<Vec<_>>>()?;
        for (k, j) in key_idx.iter().enumerate() {
            if values[*j] != key_values[k] {
                return Err(ExecutionError::InvalidPlan(format!(
                    "row {} has {} = {} but the table key has {}",
                    i, spec.key[k], values[*j], key_values[k]
                )));
            }
        }
        rows.push(values);
    }
    let key = GroupKey::new(key_cols, key_values)?;
    Table::from_rows(key, spec.columns.clone(), rows, alloc)
}

impl Source for FromSource {
    fn add_transformation(&mut self, t: Box<dyn Transformation>) {
        self.ts.push(t);
    }

    fn run(&mut self, ctx: &RunContext) {
        let err = self.emit_all(ctx).err();
        if let Some(e) = &err {
            debug!("source {} failed: {}", self.label, e);
        }
        for t in self.ts.iter_mut() {
            t.finish(self.id, err.clone());
        }
    }

    fn set_label(&mut self, label: String) {
        self.label = label;
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn metadata(&self) -> Option<Metadata> {
        let mut meta = Metadata::new();
        meta.insert("rows_emitted".to_string(), vec![self.rows_emitted.into()]);
        meta.insert("tables_emitted".to_string(), vec![self.tables_emitted.into()]);
        meta.insert("label".to_string(), vec![self.label.clone().into()]);
        Some(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::context::{ParallelOpts, StreamContext};
    use crate::exec::dataset::tests::{Event, Recorder};
    use crate::exec::value::ColType;
    use chrono::Utc;
    use serde_json::json;

    fn spec(host: &str, values: &[i64]) -> TableSpec {
        TableSpec {
            key: vec!["host".into()],
            columns: vec![
                ColMeta::new("host", ColType::String),
                ColMeta::new("_value", ColType::Int),
            ],
            rows: values.iter().map(|v| vec![json!(host), json!(v)]).collect(),
        }
    }

    #[test]
    fn test_emits_tables_then_watermark_and_finish() {
        let id = DatasetId::from_node_id("from0", 0);
        let mut source = FromSource::new(
            id,
            vec![spec("a", &[1, 2]), spec("b", &[3])],
            None,
            Allocator::unlimited(),
        );
        let recorder = Recorder::default();
        source.add_transformation(Box::new(recorder.clone()));
        source.set_label("from0".into());
        source.run(&RunContext::background());

        assert_eq!(
            recorder.events(),
            vec![
                Event::Process(id, 2),
                Event::Process(id, 1),
                Event::Watermark(id, Time::MAX),
                Event::Finish(id, None),
            ]
        );
        let meta = source.metadata().unwrap();
        assert_eq!(meta["rows_emitted"], vec![json!(3)]);
        assert_eq!(meta["tables_emitted"], vec![json!(2)]);
        assert_eq!(meta["label"], vec![json!("from0")]);
    }

    #[test]
    fn test_key_values_from_first_row() {
        let table = build_table(&spec("a", &[1, 2]), &Allocator::unlimited()).unwrap();
        assert_eq!(table.key().value("host"), Some(&Value::String("a".into())));

        let empty = build_table(&spec("a", &[]), &Allocator::unlimited()).unwrap();
        assert_eq!(empty.key().value("host"), Some(&Value::Null));
        assert!(empty.is_empty());
    }

    #[test]
    fn test_rows_must_share_key_values() {
        let mut mixed = spec("a", &[1]);
        mixed.rows.push(vec![json!("b"), json!(2)]);
        let err = build_table(&mixed, &Allocator::unlimited()).unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidPlan(_)));
        assert!(err.to_string().contains("row 1 has host = b"));
    }

    #[test]
    fn test_bad_rows_finish_with_error() {
        let id = DatasetId::from_node_id("from0", 0);
        let mut bad = spec("a", &[1]);
        bad.rows.push(vec![json!("a")]);
        let mut source = FromSource::new(id, vec![bad], None, Allocator::unlimited());
        let recorder = Recorder::default();
        source.add_transformation(Box::new(recorder.clone()));
        source.run(&RunContext::background());

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::Finish(_, Some(ExecutionError::InvalidPlan(_)))));
    }

    #[test]
    fn test_cancelled_context_stops_emission() {
        let id = DatasetId::from_node_id("from0", 0);
        let mut source =
            FromSource::new(id, vec![spec("a", &[1])], None, Allocator::unlimited());
        let recorder = Recorder::default();
        source.add_transformation(Box::new(recorder.clone()));
        let ctx = RunContext::background();
        ctx.cancel();
        source.run(&ctx);
        assert_eq!(
            recorder.events(),
            vec![Event::Finish(id, Some(ExecutionError::Canceled))]
        );
    }

    #[test]
    fn test_replicas_split_round_robin() {
        let plan_spec = ProcedureSpec::From(crate::plan::procedure::FromSpec {
            tables: vec![spec("a", &[1]), spec("b", &[2]), spec("c", &[3])],
        });
        let create = match registration() {
            Registration::Source(_, create) => create,
            Registration::Transformation(..) => unreachable!(),
        };
        let mut emitted = Vec::new();
        for group in 0..2 {
            let ec = ExecutionContext::new(
                RunContext::background(),
                Vec::new(),
                StreamContext::new(Some(Bounds::new(Time(0), Time(100)))),
                ParallelOpts { group, factor: 2 },
                Allocator::unlimited(),
                Utc::now(),
            );
            let id = DatasetId::from_node_id("from0", group);
            let mut source = create(&plan_spec, id, &ec).unwrap();
            let recorder = Recorder::default();
            source.add_transformation(Box::new(recorder.clone()));
            source.run(&RunContext::background());
            let events = recorder.events();
            assert!(events.contains(&Event::Watermark(id, Time(100))));
            emitted.push(
                events
                    .iter()
                    .filter(|e| matches!(e, Event::Process(..)))
                    .count(),
            );
        }
        assert_eq!(emitted, vec![2, 1]);
    }
}
