// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! `filter` transformation: keeps the rows matching a predicate

use crate::exec::context::ExecutionContext;
use crate::exec::dataset::TableDataset;
use crate::exec::error::{ExecutionError, Result};
use crate::exec::node::{AccumulationMode, Dataset, DatasetId, Transformation};
use crate::exec::parents::ParentStates;
use crate::exec::registry::{Registration, TransformationPair};
use crate::exec::table::{GroupKey, Table, TableBuilderCache};
use crate::exec::time::Time;
use crate::exec::value::{ColType, Value};
use crate::operators::invalid_spec;
use crate::plan::procedure::{CompareOp, FilterSpec, Predicate, ProcedureKind, ProcedureSpec};
use regex::Regex;
use std::cmp::Ordering;
use std::sync::Arc;

pub(crate) fn registration() -> Registration {
    Registration::Transformation(ProcedureKind::Filter, Arc::new(create_filter))
}

fn create_filter(
    id: DatasetId,
    mode: AccumulationMode,
    spec: &ProcedureSpec,
    ec: &ExecutionContext,
) -> Result<TransformationPair> {
    let ProcedureSpec::Filter(spec) = spec else {
        return Err(invalid_spec(ProcedureKind::Filter, spec));
    };
    let cache = TableBuilderCache::new(ec.allocator().clone());
    let d = TableDataset::new(id, mode, cache);
    let t = FilterTransformation::new(d.clone(), spec, ec.parents())?;
    Ok((Box::new(t), Arc::new(d)))
}

/// Predicate with its regular expressions compiled
#[derive(Debug, Clone)]
enum CompiledPredicate {
    Compare {
        column: String,
        cmp: CompareOp,
        value: serde_json::Value,
    },
    Regex {
        column: String,
        regex: Regex,
    },
    And(Vec<CompiledPredicate>),
    Or(Vec<CompiledPredicate>),
    Not(Box<CompiledPredicate>),
}

impl CompiledPredicate {
    fn compile(pred: &Predicate) -> Result<Self> {
        Ok(match pred {
            Predicate::Compare { column, cmp, value } => CompiledPredicate::Compare {
                column: column.clone(),
                cmp: *cmp,
                value: value.clone(),
            },
            Predicate::Regex { column, pattern } => CompiledPredicate::Regex {
                column: column.clone(),
                regex: Regex::new(pattern)?,
            },
            Predicate::And { preds } => CompiledPredicate::And(
                preds.iter().map(Self::compile).collect::<Result<_>>()?,
            ),
            Predicate::Or { preds } => CompiledPredicate::Or(
                preds.iter().map(Self::compile).collect::<Result<_>>()?,
            ),
            Predicate::Not { pred } => CompiledPredicate::Not(Box::new(Self::compile(pred)?)),
        })
    }

    /// Resolve columns and literals against the schema of `table`
    fn bind<'a>(&'a self, table: &Table) -> BoundPredicate<'a> {
        match self {
            CompiledPredicate::Compare { column, cmp, value } => {
                let col = table.col_idx(column);
                let col_type = col.map(|j| table.cols()[j].col_type);
                BoundPredicate::Compare {
                    col,
                    cmp: *cmp,
                    value: literal(value, col_type),
                }
            }
            CompiledPredicate::Regex { column, regex } => BoundPredicate::Regex {
                col: table.col_idx(column),
                regex,
            },
            CompiledPredicate::And(preds) => {
                BoundPredicate::And(preds.iter().map(|p| p.bind(table)).collect())
            }
            CompiledPredicate::Or(preds) => {
                BoundPredicate::Or(preds.iter().map(|p| p.bind(table)).collect())
            }
            CompiledPredicate::Not(pred) => BoundPredicate::Not(Box::new(pred.bind(table))),
        }
    }
}

/// Convert a literal to the column type, falling back to its natural type
fn literal(json: &serde_json::Value, col_type: Option<ColType>) -> Value {
    if let Some(t) = col_type {
        if let Ok(v) = Value::from_json(json, t) {
            return v;
        }
    }
    match json {
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
        },
        serde_json::Value::String(s) => Value::String(s.clone()),
        _ => Value::Null,
    }
}

enum BoundPredicate<'a> {
    Compare {
        col: Option<usize>,
        cmp: CompareOp,
        value: Value,
    },
    Regex {
        col: Option<usize>,
        regex: &'a Regex,
    },
    And(Vec<BoundPredicate<'a>>),
    Or(Vec<BoundPredicate<'a>>),
    Not(Box<BoundPredicate<'a>>),
}

impl BoundPredicate<'_> {
    /// Null and missing cells never match a comparison or a regex.
    fn eval(&self, table: &Table, i: usize) -> bool {
        match self {
            BoundPredicate::Compare { col, cmp, value } => {
                let ord = match col.map(|j| table.value(i, j)) {
                    Some(cell) if !cell.is_null() => cell.compare(value),
                    _ => None,
                };
                match (ord, cmp) {
                    (None, _) => false,
                    (Some(o), CompareOp::Eq) => o == Ordering::Equal,
                    (Some(o), CompareOp::Ne) => o != Ordering::Equal,
                    (Some(o), CompareOp::Lt) => o == Ordering::Less,
                    (Some(o), CompareOp::Le) => o != Ordering::Greater,
                    (Some(o), CompareOp::Gt) => o == Ordering::Greater,
                    (Some(o), CompareOp::Ge) => o != Ordering::Less,
                }
            }
            BoundPredicate::Regex { col, regex } => col
                .and_then(|j| table.value(i, j).as_str())
                .map(|s| regex.is_match(s))
                .unwrap_or(false),
            BoundPredicate::And(preds) => preds.iter().all(|p| p.eval(table, i)),
            BoundPredicate::Or(preds) => preds.iter().any(|p| p.eval(table, i)),
            BoundPredicate::Not(pred) => !pred.eval(table, i),
        }
    }
}

pub struct FilterTransformation {
    d: TableDataset,
    predicate: CompiledPredicate,
    keep_empty_tables: bool,
    parents: ParentStates,
}

impl FilterTransformation {
    pub fn new(d: TableDataset, spec: &FilterSpec, parents: &[DatasetId]) -> Result<Self> {
        Ok(Self {
            d,
            predicate: CompiledPredicate::compile(&spec.predicate)?,
            keep_empty_tables: spec.keep_empty_tables,
            parents: ParentStates::new(parents),
        })
    }
}

impl Transformation for FilterTransformation {
    fn process(&mut self, _id: DatasetId, table: Table) -> Result<()> {
        let bound = self.predicate.bind(&table);
        let matching: Vec<usize> = (0..table.len()).filter(|i| bound.eval(&table, *i)).collect();
        if matching.is_empty() && !self.keep_empty_tables {
            return Ok(());
        }

        let mut cache = self.d.cache();
        let (builder, _) = cache.table_builder(table.key());
        builder.ensure_cols(table.cols())?;
        for i in matching {
            builder.append_table_row(&table, i)?;
        }
        Ok(())
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
        "filter"
    }
}
