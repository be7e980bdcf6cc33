// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Datasets: per-node output sinks
//!
//! [`TableDataset`] buffers rows in a [`TableBuilderCache`] and flushes them
//! according to the node's trigger. [`PassthroughDataset`] forwards finished
//! tables unchanged for operators that never need to rebuild them.

use crate::exec::error::{ExecutionError, Result};
use crate::exec::node::{AccumulationMode, Dataset, DatasetContext, DatasetId, Transformation};
use crate::exec::run_context::RunContext;
use crate::exec::table::{GroupKey, Table, TableBuilderCache};
use crate::exec::time::Time;
use crate::exec::trigger::{Trigger, TriggerContext, TriggerSpec};
use log::debug;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::sync::Arc;

struct TableDatasetState {
    id: DatasetId,
    ts: Vec<Box<dyn Transformation>>,
    mode: AccumulationMode,
    watermark: Time,
    processing_time: Time,
    cache: TableBuilderCache,
    trigger_spec: TriggerSpec,
    ctx: Option<RunContext>,
    finished: bool,
}

/// Dataset that buffers tables by group key and emits them when their
/// trigger fires.
///
/// Clones are handles onto the same dataset.
#[derive(Clone)]
pub struct TableDataset {
    id: DatasetId,
    state: Arc<Mutex<TableDatasetState>>,
}

impl TableDataset {
    pub fn new(id: DatasetId, mode: AccumulationMode, cache: TableBuilderCache) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(TableDatasetState {
                id,
                ts: Vec::new(),
                mode,
                watermark: Time::MIN,
                processing_time: Time::MIN,
                cache,
                trigger_spec: TriggerSpec::default(),
                ctx: None,
                finished: false,
            })),
        }
    }

    /// Lock the builder cache.
    ///
    /// The guard must be dropped before calling any other method of the
    /// dataset.
    pub fn cache(&self) -> MappedMutexGuard<'_, TableBuilderCache> {
        MutexGuard::map(self.state.lock(), |s| &mut s.cache)
    }

    pub fn mode(&self) -> AccumulationMode {
        self.state.lock().mode
    }

    pub fn watermark(&self) -> Time {
        self.state.lock().watermark
    }
}

impl TableDatasetState {
    fn check_context(&self) -> Result<()> {
        match self.ctx.as_ref().and_then(RunContext::err) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn eval_triggers(&mut self) -> Result<()> {
        for key in self.cache.keys() {
            let count = match self.cache.get(&key) {
                Some(builder) => builder.n_rows(),
                None => continue,
            };
            if count == 0 {
                continue;
            }
            let c = TriggerContext {
                key: &key,
                count,
                watermark: self.watermark,
                current_processing_time: self.processing_time,
            };
            let spec = &self.trigger_spec;
            let (fired, finished) = match self.cache.trigger_mut(&key) {
                Some(slot) => {
                    let trigger = slot.get_or_insert_with(|| Trigger::new(spec));
                    let fired = trigger.triggered(&c);
                    (fired, trigger.finished())
                }
                None => continue,
            };
            if fired {
                self.trigger_table(&key)?;
            }
            if finished {
                self.cache.expire_table(&key);
            }
        }
        Ok(())
    }

    fn trigger_table(&mut self, key: &GroupKey) -> Result<()> {
        let table = match self.cache.get_mut(key) {
            Some(builder) => match self.mode {
                AccumulationMode::Discarding => builder.take_table(),
                AccumulationMode::Accumulating => builder.table()?,
            },
            None => return Ok(()),
        };
        self.check_context()?;
        let id = self.id;
        for t in self.ts.iter_mut() {
            t.process(id, table.clone())?;
        }
        Ok(())
    }
}

impl Dataset for TableDataset {
    fn id(&self) -> DatasetId {
        self.id
    }

    fn add_transformation(&self, t: Box<dyn Transformation>) {
        self.state.lock().ts.push(t);
    }

    fn set_trigger_spec(&self, spec: TriggerSpec) {
        self.state.lock().trigger_spec = spec;
    }

    fn retract_table(&self, key: &GroupKey) -> Result<()> {
        let mut state = self.state.lock();
        state.cache.expire_table(key);
        let id = state.id;
        for t in state.ts.iter_mut() {
            t.retract_table(id, key)?;
        }
        Ok(())
    }

    fn update_watermark(&self, mark: Time) -> Result<()> {
        let mut state = self.state.lock();
        state.watermark = mark;
        state.eval_triggers()?;
        let id = state.id;
        for t in state.ts.iter_mut() {
            t.update_watermark(id, mark)?;
        }
        Ok(())
    }

    fn update_processing_time(&self, time: Time) -> Result<()> {
        let mut state = self.state.lock();
        state.processing_time = time;
        state.eval_triggers()?;
        let id = state.id;
        for t in state.ts.iter_mut() {
            t.update_processing_time(id, time)?;
        }
        Ok(())
    }

    fn finish(&self, err: Option<ExecutionError>) {
        let mut state = self.state.lock();
        if state.finished {
            debug!("dataset {} finished more than once", state.id);
            return;
        }
        state.finished = true;

        let mut err = err;
        if err.is_none() {
            // Tables are only flushed when the node finished cleanly.
            for key in state.cache.keys() {
                if let Err(e) = state.trigger_table(&key) {
                    err = Some(e);
                    break;
                }
                state.cache.expire_table(&key);
            }
        }
        for key in state.cache.keys() {
            state.cache.expire_table(&key);
        }

        let id = state.id;
        for t in state.ts.iter_mut() {
            t.finish(id, err.clone());
        }
        state.ts.clear();
    }

    fn as_context_aware(&self) -> Option<&dyn DatasetContext> {
        Some(self)
    }
}

impl DatasetContext for TableDataset {
    fn with_context(&self, ctx: RunContext) {
        self.state.lock().ctx = Some(ctx);
    }
}

struct PassthroughState {
    ts: Vec<Box<dyn Transformation>>,
    finished: bool,
}

/// Dataset that forwards whole tables without buffering them
#[derive(Clone)]
pub struct PassthroughDataset {
    id: DatasetId,
    state: Arc<Mutex<PassthroughState>>,
}

impl PassthroughDataset {
    pub fn new(id: DatasetId) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(PassthroughState {
                ts: Vec::new(),
                finished: false,
            })),
        }
    }

    /// Forward a table to every consumer
    pub fn process(&self, table: Table) -> Result<()> {
        let mut state = self.state.lock();
        for t in state.ts.iter_mut() {
            t.process(self.id, table.clone())?;
        }
        Ok(())
    }
}

impl Dataset for PassthroughDataset {
    fn id(&self) -> DatasetId {
        self.id
    }

    fn add_transformation(&self, t: Box<dyn Transformation>) {
        self.state.lock().ts.push(t);
    }

    fn set_trigger_spec(&self, _spec: TriggerSpec) {}

    fn retract_table(&self, key: &GroupKey) -> Result<()> {
        let mut state = self.state.lock();
        for t in state.ts.iter_mut() {
            t.retract_table(self.id, key)?;
        }
        Ok(())
    }

    fn update_watermark(&self, mark: Time) -> Result<()> {
        let mut state = self.state.lock();
        for t in state.ts.iter_mut() {
            t.update_watermark(self.id, mark)?;
        }
        Ok(())
    }

    fn update_processing_time(&self, time: Time) -> Result<()> {
        let mut state = self.state.lock();
        for t in state.ts.iter_mut() {
            t.update_processing_time(self.id, time)?;
        }
        Ok(())
    }

    fn finish(&self, err: Option<ExecutionError>) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        for t in state.ts.iter_mut() {
            t.finish(self.id, err.clone());
        }
        state.ts.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::exec::memory::Allocator;
    use crate::exec::table::{add_table_key_cols, append_key_values, group_key_of};
    use crate::exec::value::{ColMeta, ColType, Value};

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Event {
        Process(DatasetId, usize),
        Retract(DatasetId),
        Watermark(DatasetId, Time),
        ProcessingTime(DatasetId, Time),
        Finish(DatasetId, Option<ExecutionError>),
    }

    /// Records every call it receives
    #[derive(Clone, Default)]
    pub(crate) struct Recorder {
        pub events: Arc<Mutex<Vec<Event>>>,
    }

    impl Recorder {
        pub fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }
    }

    impl Transformation for Recorder {
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
    }

    /// Keeps every table it receives
    #[derive(Clone, Default)]
    pub(crate) struct Collector {
        tables: Arc<Mutex<Vec<Table>>>,
        finished: Arc<Mutex<Option<Option<ExecutionError>>>>,
    }

    impl Collector {
        pub fn tables(&self) -> Vec<Table> {
            self.tables.lock().clone()
        }

        /// `Some(err)` once finished
        pub fn finished(&self) -> Option<Option<ExecutionError>> {
            self.finished.lock().clone()
        }
    }

    impl Transformation for Collector {
        fn process(&mut self, _id: DatasetId, table: Table) -> Result<()> {
            self.tables.lock().push(table);
            Ok(())
        }

        fn retract_table(&mut self, _id: DatasetId, _key: &GroupKey) -> Result<()> {
            Ok(())
        }

        fn update_watermark(&mut self, _id: DatasetId, _mark: Time) -> Result<()> {
            Ok(())
        }

        fn update_processing_time(&mut self, _id: DatasetId, _time: Time) -> Result<()> {
            Ok(())
        }

        fn finish(&mut self, _id: DatasetId, err: Option<ExecutionError>) {
            *self.finished.lock() = Some(err);
        }
    }

    fn fill(dataset: &TableDataset, key: &GroupKey, rows: usize) {
        let mut cache = dataset.cache();
        let (builder, created) = cache.table_builder(key);
        if created {
            add_table_key_cols(key, builder).unwrap();
            builder.add_col(ColMeta::new("_value", ColType::Int)).unwrap();
        }
        for i in 0..rows {
            append_key_values(key, builder).unwrap();
            let j = builder.col_idx("_value").unwrap();
            builder.append_value(j, Value::Int(i as i64)).unwrap();
        }
    }

    fn setup(mode: AccumulationMode) -> (TableDataset, Recorder, Allocator) {
        let alloc = Allocator::unlimited();
        let id = DatasetId::from_node_id("ds", 0);
        let dataset = TableDataset::new(id, mode, TableBuilderCache::new(alloc.clone()));
        let recorder = Recorder::default();
        dataset.add_transformation(Box::new(recorder.clone()));
        (dataset, recorder, alloc)
    }

    fn stop_key(stop: i64) -> GroupKey {
        group_key_of(&[("_stop", Value::Time(Time(stop)))]).unwrap()
    }

    #[test]
    fn test_watermark_fires_ready_tables() {
        let (dataset, recorder, _) = setup(AccumulationMode::Discarding);
        let id = dataset.id();
        fill(&dataset, &stop_key(10), 2);
        fill(&dataset, &stop_key(20), 3);

        dataset.update_watermark(Time(15)).unwrap();
        assert_eq!(
            recorder.events(),
            vec![Event::Process(id, 2), Event::Watermark(id, Time(15))]
        );
        assert_eq!(dataset.cache().len(), 1);
    }

    #[test]
    fn test_accumulating_keeps_rows() {
        let (dataset, recorder, _) = setup(AccumulationMode::Accumulating);
        dataset.set_trigger_spec(TriggerSpec::Repeated {
            trigger: Box::new(TriggerSpec::Narrow),
        });
        let id = dataset.id();
        let key = GroupKey::empty();
        fill(&dataset, &key, 2);
        dataset.update_processing_time(Time(1)).unwrap();
        fill(&dataset, &key, 1);
        dataset.update_processing_time(Time(2)).unwrap();

        let processed: Vec<Event> = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Process(..)))
            .collect();
        assert_eq!(processed, vec![Event::Process(id, 2), Event::Process(id, 3)]);
    }

    #[test]
    fn test_finish_flushes_and_releases_memory() {
        let (dataset, recorder, alloc) = setup(AccumulationMode::Discarding);
        let id = dataset.id();
        fill(&dataset, &GroupKey::empty(), 4);
        assert!(alloc.allocated() > 0);

        dataset.finish(None);
        assert_eq!(
            recorder.events(),
            vec![Event::Process(id, 4), Event::Finish(id, None)]
        );
        assert!(dataset.cache().is_empty());
        assert_eq!(alloc.allocated(), 0);

        dataset.finish(None);
        assert_eq!(recorder.events().len(), 2);
    }

    #[test]
    fn test_finish_with_error_skips_flush() {
        let (dataset, recorder, alloc) = setup(AccumulationMode::Discarding);
        let id = dataset.id();
        fill(&dataset, &GroupKey::empty(), 4);

        dataset.finish(Some(ExecutionError::Internal("boom".into())));
        assert_eq!(
            recorder.events(),
            vec![Event::Finish(
                id,
                Some(ExecutionError::Internal("boom".into()))
            )]
        );
        assert_eq!(alloc.allocated(), 0);
    }

    #[test]
    fn test_cancelled_context_stops_emission() {
        let (dataset, recorder, _) = setup(AccumulationMode::Discarding);
        let id = dataset.id();
        let ctx = RunContext::background();
        dataset
            .as_context_aware()
            .expect("table dataset accepts a context")
            .with_context(ctx.clone());
        fill(&dataset, &GroupKey::empty(), 1);
        ctx.cancel();

        dataset.finish(None);
        assert_eq!(
            recorder.events(),
            vec![Event::Finish(id, Some(ExecutionError::Canceled))]
        );
    }

    #[test]
    fn test_passthrough_forwards() {
        let id = DatasetId::from_node_id("limit", 0);
        let dataset = PassthroughDataset::new(id);
        let recorder = Recorder::default();
        dataset.add_transformation(Box::new(recorder.clone()));

        let table = Table::new(GroupKey::empty(), vec![], vec![]).unwrap();
        dataset.process(table).unwrap();
        dataset.retract_table(&GroupKey::empty()).unwrap();
        dataset.update_watermark(Time(3)).unwrap();
        dataset.finish(None);
        dataset.finish(None);
        assert_eq!(
            recorder.events(),
            vec![
                Event::Process(id, 0),
                Event::Retract(id),
                Event::Watermark(id, Time(3)),
                Event::Finish(id, None),
            ]
        );
    }
}
