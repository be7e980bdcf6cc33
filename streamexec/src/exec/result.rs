// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Named query results
//!
//! A result has two halves. The [`ResultSink`] is attached as a consumer of a
//! terminal node and hands every table over a rendezvous channel to the
//! [`QueryResult`] the caller reads from. Either half observes an abort: the
//! sink stops blocking and the reader reports the abort error.

use crate::exec::error::{ExecutionError, Result};
use crate::exec::node::{DatasetId, Transformation};
use crate::exec::table::{GroupKey, Table};
use crate::exec::time::Time;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::debug;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

enum ResultMessage {
    Table(Table),
    Done(Option<ExecutionError>),
}

/// What the reader observed while waiting
enum Received {
    Message(ResultMessage),
    Disconnected,
    Aborted,
}

struct AbortState {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
    err: Mutex<Option<ExecutionError>>,
}

impl AbortState {
    fn err(&self) -> Option<ExecutionError> {
        self.err.lock().clone()
    }
}

/// Create the sink and reader halves of a result named `name`
pub fn new_result(name: impl Into<String>) -> (ResultSink, QueryResult) {
    let name = name.into();
    let (tx, rx) = bounded(0);
    let (abort_tx, abort_rx) = bounded(0);
    let abort = Arc::new(AbortState {
        tx: Mutex::new(Some(abort_tx)),
        rx: abort_rx,
        err: Mutex::new(None),
    });
    let sink = ResultSink {
        name: name.clone(),
        tx: Some(tx),
        abort: abort.clone(),
    };
    let result = QueryResult {
        name,
        rx,
        abort,
        done: false,
    };
    (sink, result)
}

/// Handle that fails a result from the executor's abort path
#[derive(Clone)]
pub struct ResultAbort {
    name: String,
    abort: Arc<AbortState>,
}

impl ResultAbort {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark the result failed with `err`. Only the first abort is recorded.
    pub fn abort(&self, err: ExecutionError) {
        let mut current = self.abort.err.lock();
        if current.is_some() {
            return;
        }
        debug!("aborting result {:?}: {}", self.name, err);
        *current = Some(err);
        self.abort.tx.lock().take();
    }
}

/// Consumer end of a terminal node
pub struct ResultSink {
    name: String,
    tx: Option<Sender<ResultMessage>>,
    abort: Arc<AbortState>,
}

impl ResultSink {
    pub fn abort_handle(&self) -> ResultAbort {
        ResultAbort {
            name: self.name.clone(),
            abort: self.abort.clone(),
        }
    }

    fn send(&self, msg: ResultMessage) -> Result<()> {
        let tx = match &self.tx {
            Some(tx) => tx,
            None => return Ok(()),
        };
        select! {
            send(tx, msg) -> res => {
                if res.is_err() {
                    debug!("result {:?} has no reader, dropping output", self.name);
                }
                Ok(())
            }
            recv(self.abort.rx) -> _ => Err(self.abort.err().unwrap_or(ExecutionError::Canceled)),
        }
    }
}

impl Transformation for ResultSink {
    fn process(&mut self, _id: DatasetId, table: Table) -> Result<()> {
        self.send(ResultMessage::Table(table))
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
        // An aborted result already carries its error.
        let _ = self.send(ResultMessage::Done(err));
        self.tx.take();
    }

    fn label(&self) -> &str {
        &self.name
    }
}

/// Readable stream of tables produced under one result name
pub struct QueryResult {
    name: String,
    rx: Receiver<ResultMessage>,
    abort: Arc<AbortState>,
    done: bool,
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("name", &self.name)
            .field("done", &self.done)
            .finish()
    }
}

impl QueryResult {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn abort_handle(&self) -> ResultAbort {
        ResultAbort {
            name: self.name.clone(),
            abort: self.abort.clone(),
        }
    }

    /// Error the result was aborted with, if any
    pub fn err(&self) -> Option<ExecutionError> {
        self.abort.err()
    }

    /// Block for the next table.
    ///
    /// Returns `None` once the result completed. A failed or aborted result
    /// yields its error once, then `None`.
    pub fn next_table(&mut self) -> Option<Result<Table>> {
        if self.done {
            return None;
        }
        if let Some(err) = self.abort.err() {
            self.done = true;
            return Some(Err(err));
        }
        let received = select! {
            recv(self.rx) -> msg => match msg {
                Ok(msg) => Received::Message(msg),
                Err(_) => Received::Disconnected,
            },
            recv(self.abort.rx) -> _ => Received::Aborted,
        };
        match received {
            Received::Message(ResultMessage::Table(table)) => Some(Ok(table)),
            Received::Message(ResultMessage::Done(Some(err))) => {
                self.done = true;
                Some(Err(err))
            }
            Received::Message(ResultMessage::Done(None)) | Received::Aborted => {
                self.done = true;
                self.abort.err().map(Err)
            }
            // The producer went away without finishing the result.
            Received::Disconnected => {
                self.done = true;
                Some(Err(self.abort.err().unwrap_or_else(|| {
                    ExecutionError::Internal("result producer dropped without finishing".into())
                })))
            }
        }
    }

    /// Iterate over the remaining tables
    pub fn tables(&mut self) -> Tables<'_> {
        Tables { result: self }
    }

    /// Call `f` for every table, stopping at the first error
    pub fn do_each<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(Table) -> Result<()>,
    {
        while let Some(table) = self.next_table() {
            f(table?)?;
        }
        Ok(())
    }

    /// Read every remaining table
    pub fn collect_tables(&mut self) -> Result<Vec<Table>> {
        let mut tables = Vec::new();
        self.do_each(|t| {
            tables.push(t);
            Ok(())
        })?;
        Ok(tables)
    }
}

/// Iterator over the tables of a [`QueryResult`]
pub struct Tables<'a> {
    result: &'a mut QueryResult,
}

impl Iterator for Tables<'_> {
    type Item = Result<Table>;

    fn next(&mut self) -> Option<Self::Item> {
        self.result.next_table()
    }
}
