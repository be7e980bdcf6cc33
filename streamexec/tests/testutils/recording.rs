// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Operators for observing and breaking the engine

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use streamexec::exec::registry::{CreateSource, CreateTransformation, TransformationPair};
use streamexec::exec::{
    default_registry, AccumulationMode, ColMeta, ColType, Dataset, DatasetId, ExecutionContext,
    GroupKey, PassthroughDataset, Source, Time, Transformation,
};
use streamexec::plan::{ProcedureKind, ProcedureSpec};
use streamexec::{Allocator, ErrorCode, ExecutionError, Result, RunContext, Table, Value};

/// Protocol call seen by a [`RecordingTransformation`]
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Process(DatasetId, usize),
    Retract(DatasetId),
    Watermark(DatasetId, Time),
    ProcessingTime(DatasetId, Time),
    Finish(DatasetId, Option<ExecutionError>),
}

/// Records every call it receives. Clones share the record.
#[derive(Clone, Default)]
pub struct RecordingTransformation {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingTransformation {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn finishes(&self) -> Vec<Option<ExecutionError>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Finish(_, err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Transformation for RecordingTransformation {
    fn process(&mut self, id: DatasetId, table: Table) -> Result<()> {
        self.events.lock().push(Event::Process(id, table.len()));
        Ok(())
    }

    fn retract_table(&mut self, id: DatasetId, _key: &GroupKey) -> Result<()> {
        self.events.lock().push(Event::Retract(id));
        Ok(())
    }

    fn update_watermark(&mut self, id: DatasetId, mark: Time) -> Result<()> {
        self.events.lock().push(Event::Watermark(id, mark));
        Ok(())
    }

    fn update_processing_time(&mut self, id: DatasetId, time: Time) -> Result<()> {
        self.events.lock().push(Event::ProcessingTime(id, time));
        Ok(())
    }

    fn finish(&mut self, id: DatasetId, err: Option<ExecutionError>) {
        self.events.lock().push(Event::Finish(id, err));
    }

    fn label(&self) -> &str {
        "recording"
    }
}

/// Parent lists handed to constructors, by the id of the replica built
pub type ParentLog = Arc<Mutex<BTreeMap<DatasetId, Vec<DatasetId>>>>;

/// The built-in merge constructor, logging the parents of every replica
pub fn recording_merge(log: ParentLog) -> CreateTransformation {
    Arc::new(
        move |id: DatasetId,
              mode: AccumulationMode,
              spec: &ProcedureSpec,
              ec: &ExecutionContext|
              -> Result<TransformationPair> {
            log.lock().insert(id, ec.parents().to_vec());
            let create = default_registry()
                .transformation(ProcedureKind::Merge)
                .cloned()
                .ok_or_else(|| ExecutionError::Internal("merge is not registered".into()))?;
            create(id, mode, spec, ec)
        },
    )
}

/// Source emitting one-row tables until its context is done.
///
/// It signals `stopped` when it returns, so tests can check that it noticed
/// the cancellation.
pub struct EndlessSource {
    id: DatasetId,
    label: String,
    alloc: Allocator,
    ts: Vec<Box<dyn Transformation>>,
    stopped: Sender<()>,
}

impl Source for EndlessSource {
    fn add_transformation(&mut self, t: Box<dyn Transformation>) {
        self.ts.push(t);
    }

    fn run(&mut self, ctx: &RunContext) {
        let key = GroupKey::empty();
        let mut i = 0i64;
        while !ctx.is_done() {
            let table = Table::from_rows(
                key.clone(),
                vec![ColMeta::new("_value", ColType::Int)],
                vec![vec![Value::Int(i)]],
                &self.alloc,
            );
            if let Ok(table) = table {
                for t in self.ts.iter_mut() {
                    // Consumers that gave up report errors; keep going until cancelled.
                    let _ = t.process(self.id, table.clone());
                }
            }
            i += 1;
            thread::sleep(Duration::from_millis(1));
        }
        for t in self.ts.iter_mut() {
            t.finish(self.id, ctx.err());
        }
        let _ = self.stopped.send(());
    }

    fn set_label(&mut self, label: String) {
        self.label = label;
    }

    fn label(&self) -> &str {
        &self.label
    }
}

pub fn endless_source(stopped: Sender<()>) -> CreateSource {
    Arc::new(
        move |_spec: &ProcedureSpec,
              id: DatasetId,
              ec: &ExecutionContext|
              -> Result<Box<dyn Source>> {
            Ok(Box::new(EndlessSource {
                id,
                label: "endless".to_string(),
                alloc: ec.allocator().clone(),
                ts: Vec::new(),
                stopped: stopped.clone(),
            }))
        },
    )
}

/// Source that panics as soon as it runs, holding on to its consumers
pub struct PanickingSource {
    label: String,
    ts: Vec<Box<dyn Transformation>>,
}

impl Source for PanickingSource {
    fn add_transformation(&mut self, t: Box<dyn Transformation>) {
        self.ts.push(t);
    }

    fn run(&mut self, _ctx: &RunContext) {
        panic!("source exploded");
    }

    fn set_label(&mut self, label: String) {
        self.label = label;
    }

    fn label(&self) -> &str {
        &self.label
    }
}

pub fn panicking_source() -> CreateSource {
    Arc::new(
        |_spec: &ProcedureSpec, _id: DatasetId, _ec: &ExecutionContext| -> Result<Box<dyn Source>> {
            Ok(Box::new(PanickingSource {
                label: "panicking".to_string(),
                ts: Vec::new(),
            }))
        },
    )
}

/// Message of the error [`FailingTransformation`] fails with
pub const FAILURE_MESSAGE: &str = "failing transformation rejected a table";

/// Transformation whose every `process` call fails
pub struct FailingTransformation {
    d: PassthroughDataset,
}

impl Transformation for FailingTransformation {
    fn process(&mut self, _id: DatasetId, _table: Table) -> Result<()> {
        Err(ExecutionError::operator(
            ErrorCode::FailedPrecondition,
            FAILURE_MESSAGE,
        ))
    }

    fn retract_table(&mut self, _id: DatasetId, key: &GroupKey) -> Result<()> {
        self.d.retract_table(key)
    }

    fn update_watermark(&mut self, _id: DatasetId, mark: Time) -> Result<()> {
        self.d.update_watermark(mark)
    }

    fn update_processing_time(&mut self, _id: DatasetId, time: Time) -> Result<()> {
        self.d.update_processing_time(time)
    }

    fn finish(&mut self, _id: DatasetId, err: Option<ExecutionError>) {
        self.d.finish(err);
    }

    fn label(&self) -> &str {
        "failing"
    }
}

pub fn failing_transformation() -> CreateTransformation {
    Arc::new(
        |id: DatasetId,
         _mode: AccumulationMode,
         _spec: &ProcedureSpec,
         _ec: &ExecutionContext|
         -> Result<TransformationPair> {
            let d = PassthroughDataset::new(id);
            let t = FailingTransformation { d: d.clone() };
            Ok((Box::new(t), Arc::new(d)))
        },
    )
}
