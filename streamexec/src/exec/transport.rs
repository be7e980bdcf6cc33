// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Per-edge transports between a producer and a consumer transformation
//!
//! A transport is the producer's view of a consumer: every protocol call is
//! queued as a message and the queue is drained by dispatcher work. At most
//! one drain of a given transport runs at a time, so messages reach the
//! consumer in the order the producer sent them.

use crate::exec::dispatcher::Scheduler;
use crate::exec::error::{ExecutionError, Result};
use crate::exec::node::{DatasetId, Transformation};
use crate::exec::run_context::RunContext;
use crate::exec::table::{GroupKey, Table};
use crate::exec::time::Time;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Transformation shared by every transport feeding it
pub type SharedTransformation = Arc<Mutex<Box<dyn Transformation>>>;

pub fn share(t: Box<dyn Transformation>) -> SharedTransformation {
    Arc::new(Mutex::new(t))
}

enum Message {
    Process(Table),
    Retract(GroupKey),
    Watermark(Time),
    ProcessingTime(Time),
    Finish(Option<ExecutionError>),
}

struct Inner {
    label: String,
    transformation: SharedTransformation,
    scheduler: Scheduler,
    throughput: usize,
    messages: Mutex<VecDeque<(DatasetId, Message)>>,
    running: AtomicBool,
    finished_tx: Mutex<Option<Sender<()>>>,
    finished_rx: Receiver<()>,
    is_finished: AtomicBool,
    err: Mutex<Option<ExecutionError>>,
}

/// Transport that applies messages to its consumer one after the other
#[derive(Clone)]
pub struct ConsecutiveTransport {
    inner: Arc<Inner>,
}

impl ConsecutiveTransport {
    pub fn new(
        label: impl Into<String>,
        transformation: SharedTransformation,
        scheduler: Scheduler,
        throughput: usize,
    ) -> Self {
        let (finished_tx, finished_rx) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                transformation,
                scheduler,
                throughput: throughput.max(1),
                messages: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                finished_tx: Mutex::new(Some(finished_tx)),
                finished_rx,
                is_finished: AtomicBool::new(false),
                err: Mutex::new(None),
            }),
        }
    }

    /// Channel that becomes disconnected once the consumer finished this edge
    pub fn finished(&self) -> &Receiver<()> {
        &self.inner.finished_rx
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished.load(Ordering::SeqCst)
    }

    pub fn err(&self) -> Option<ExecutionError> {
        self.inner.err.lock().clone()
    }

    fn push(&self, id: DatasetId, msg: Message) -> Result<()> {
        if self.is_finished() {
            return match self.err() {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }
        self.inner.messages.lock().push_back((id, msg));
        Inner::schedule(&self.inner);
        Ok(())
    }
}

impl Inner {
    fn schedule(this: &Arc<Inner>) {
        if this
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let inner = this.clone();
        this.scheduler
            .schedule(Box::new(move |ctx| Inner::process_messages(&inner, ctx)));
    }

    fn process_messages(this: &Arc<Inner>, ctx: &RunContext) -> Result<()> {
        for _ in 0..this.throughput {
            let next = this.messages.lock().pop_front();
            let (id, msg) = match next {
                Some(next) => next,
                None => break,
            };
            match this.process_message(ctx, id, msg) {
                Ok(false) => {}
                Ok(true) => {
                    this.close();
                    return Ok(());
                }
                Err(err) => {
                    warn!("transport {} failed: {}", this.label, err);
                    *this.err.lock() = Some(err.clone());
                    this.transformation.lock().finish(id, Some(err.clone()));
                    this.close();
                    return Err(err);
                }
            }
        }
        this.running.store(false, Ordering::SeqCst);
        // Messages may have been pushed after the last pop.
        if !this.messages.lock().is_empty() {
            Inner::schedule(this);
        }
        Ok(())
    }

    /// Apply one message. Returns true once the edge is finished.
    fn process_message(&self, ctx: &RunContext, id: DatasetId, msg: Message) -> Result<bool> {
        // Finish is always delivered, everything else stops once the run is done.
        if !matches!(msg, Message::Finish(_)) {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
        }
        let mut t = self.transformation.lock();
        match msg {
            Message::Process(table) => t.process(id, table)?,
            Message::Retract(key) => t.retract_table(id, &key)?,
            Message::Watermark(mark) => t.update_watermark(id, mark)?,
            Message::ProcessingTime(time) => t.update_processing_time(id, time)?,
            Message::Finish(err) => {
                t.finish(id, err);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn close(&self) {
        self.is_finished.store(true, Ordering::SeqCst);
        let dropped = self.messages.lock().len();
        if dropped > 0 {
            debug!(
                "transport {} finished with {} unprocessed messages",
                self.label, dropped
            );
        }
        self.messages.lock().clear();
        self.finished_tx.lock().take();
    }
}

impl Transformation for ConsecutiveTransport {
    fn process(&mut self, id: DatasetId, table: Table) -> Result<()> {
        self.push(id, Message::Process(table))
    }

    fn retract_table(&mut self, id: DatasetId, key: &GroupKey) -> Result<()> {
        self.push(id, Message::Retract(key.clone()))
    }

    fn update_watermark(&mut self, id: DatasetId, mark: Time) -> Result<()> {
        self.push(id, Message::Watermark(mark))
    }

    fn update_processing_time(&mut self, id: DatasetId, time: Time) -> Result<()> {
        self.push(id, Message::ProcessingTime(time))
    }

    fn finish(&mut self, id: DatasetId, err: Option<ExecutionError>) {
        let _ = self.push(id, Message::Finish(err));
    }

    fn label(&self) -> &str {
        &self.inner.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::dataset::tests::{Event, Recorder};
    use crate::exec::dispatcher::PoolDispatcher;
    use crate::exec::error::ErrorCode;
    use std::time::Duration;

    fn empty_table() -> Table {
        Table::new(GroupKey::empty(), vec![], vec![]).unwrap()
    }

    fn wait_finished(t: &ConsecutiveTransport) {
        crossbeam_channel::select! {
            recv(t.finished()) -> _ => {}
            default(Duration::from_secs(5)) => panic!("transport never finished"),
        }
    }

    #[test]
    fn test_messages_arrive_in_order() {
        let dispatcher = PoolDispatcher::new(2);
        let ctx = RunContext::background();
        dispatcher.start(4, &ctx);

        let recorder = Recorder::default();
        let mut transport = ConsecutiveTransport::new(
            "edge",
            share(Box::new(recorder.clone())),
            dispatcher.scheduler(),
            dispatcher.throughput(),
        );
        let id = DatasetId::from_node_id("src", 0);
        let mut expected = Vec::new();
        for i in 0..50 {
            transport.update_watermark(id, Time(i)).unwrap();
            expected.push(Event::Watermark(id, Time(i)));
        }
        transport.finish(id, None);
        expected.push(Event::Finish(id, None));

        wait_finished(&transport);
        assert_eq!(recorder.events(), expected);
        assert!(transport.is_finished());
        assert_eq!(dispatcher.stop(), None);
    }

    struct Failing;

    impl Transformation for Failing {
        fn process(&mut self, _id: DatasetId, _table: Table) -> Result<()> {
            Err(ExecutionError::operator(ErrorCode::Invalid, "bad table"))
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
        fn finish(&mut self, _id: DatasetId, _err: Option<ExecutionError>) {}
    }

    #[test]
    fn test_failure_finishes_edge_and_reports_error() {
        let dispatcher = PoolDispatcher::new(10);
        let ctx = RunContext::background();
        dispatcher.start(1, &ctx);

        let mut transport = ConsecutiveTransport::new(
            "edge",
            share(Box::new(Failing)),
            dispatcher.scheduler(),
            10,
        );
        let id = DatasetId::from_node_id("src", 0);
        transport.process(id, empty_table()).unwrap();
        wait_finished(&transport);

        let expected = ExecutionError::operator(ErrorCode::Invalid, "bad table");
        let err = dispatcher
            .err()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(err, expected);
        assert_eq!(transport.process(id, empty_table()), Err(expected));
        dispatcher.stop();
    }

    #[test]
    fn test_cancelled_context_fails_pending_calls() {
        // Never started, so queued work only runs when driven by hand.
        let dispatcher = PoolDispatcher::new(10);
        let recorder = Recorder::default();
        let mut transport = ConsecutiveTransport::new(
            "edge",
            share(Box::new(recorder.clone())),
            dispatcher.scheduler(),
            10,
        );
        let id = DatasetId::from_node_id("src", 0);
        transport.process(id, empty_table()).unwrap();

        let run_ctx = RunContext::background();
        run_ctx.cancel();
        assert!(Inner::process_messages(&transport.inner, &run_ctx).is_err());
        assert_eq!(
            recorder.events(),
            vec![Event::Finish(id, Some(ExecutionError::Canceled))]
        );
        assert!(transport.is_finished());
    }
}
