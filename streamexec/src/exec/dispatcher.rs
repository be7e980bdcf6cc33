// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Bounded worker pool executing transport work

use crate::exec::error::{ExecutionError, Result};
use crate::exec::run_context::RunContext;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Unit of work executed by a dispatcher worker
pub type Work = Box<dyn FnOnce(&RunContext) -> Result<()> + Send>;

/// Handle used by transports to queue work on the dispatcher
#[derive(Clone)]
pub struct Scheduler {
    work_tx: Sender<Work>,
}

impl Scheduler {
    /// Queue work. Never blocks; work queued after the dispatcher stopped is
    /// dropped.
    pub fn schedule(&self, work: Work) {
        if self.work_tx.send(work).is_err() {
            debug!("dispatcher stopped, dropping scheduled work");
        }
    }
}

/// Fixed-size pool of worker threads.
///
/// The work queue is unbounded so that work can be rescheduled from inside
/// a worker without blocking it; the number of workers bounds how much work
/// runs at once. The first error returned by any work item is kept and
/// reported through [`PoolDispatcher::err`] or [`PoolDispatcher::stop`].
pub struct PoolDispatcher {
    throughput: usize,
    work_tx: Sender<Work>,
    work_rx: Receiver<Work>,
    err_tx: Sender<ExecutionError>,
    err_rx: Receiver<ExecutionError>,
    closing_tx: Mutex<Option<Sender<()>>>,
    closing_rx: Receiver<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl PoolDispatcher {
    /// `throughput` is how many messages a transport handles per scheduling
    pub fn new(throughput: usize) -> Self {
        let (work_tx, work_rx) = unbounded();
        let (err_tx, err_rx) = bounded(1);
        let (closing_tx, closing_rx) = bounded(0);
        Self {
            throughput: throughput.max(1),
            work_tx,
            work_rx,
            err_tx,
            err_rx,
            closing_tx: Mutex::new(Some(closing_tx)),
            closing_rx,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn throughput(&self) -> usize {
        self.throughput
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler {
            work_tx: self.work_tx.clone(),
        }
    }

    /// Launch `concurrency` workers. Only the first call has an effect.
    pub fn start(&self, concurrency: usize, ctx: &RunContext) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("dispatcher already started");
            return;
        }
        let mut workers = self.workers.lock();
        for i in 0..concurrency {
            let ctx = ctx.clone();
            let work_rx = self.work_rx.clone();
            let closing_rx = self.closing_rx.clone();
            let err_tx = self.err_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("streamexec-worker-{}", i))
                .spawn(move || run_worker(&ctx, &work_rx, &closing_rx, &err_tx));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    let err = ExecutionError::Internal(format!("failed to spawn worker: {}", e));
                    error!("{}", err);
                    let _ = self.err_tx.try_send(err);
                    break;
                }
            }
        }
        debug!("dispatcher started with {} workers", workers.len());
    }

    /// Receives the first error produced by a worker
    pub fn err(&self) -> &Receiver<ExecutionError> {
        &self.err_rx
    }

    /// Stop the workers and wait for them to exit. Returns the first error
    /// seen, unless it was already taken from [`PoolDispatcher::err`].
    pub fn stop(&self) -> Option<ExecutionError> {
        self.closing_tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                error!("dispatcher worker panicked outside of work");
            }
        }
        self.err_rx.try_recv().ok()
    }
}

fn run_worker(
    ctx: &RunContext,
    work_rx: &Receiver<Work>,
    closing_rx: &Receiver<()>,
    err_tx: &Sender<ExecutionError>,
) {
    loop {
        select! {
            recv(ctx.done()) -> _ => return,
            recv(closing_rx) -> _ => return,
            recv(work_rx) -> work => match work {
                Ok(work) => do_work(ctx, work, err_tx),
                Err(_) => return,
            },
        }
    }
}

fn do_work(ctx: &RunContext, work: Work, err_tx: &Sender<ExecutionError>) {
    let outcome = catch_unwind(AssertUnwindSafe(|| work(ctx))).unwrap_or_else(|panic| {
        let msg = panic_message(panic.as_ref());
        error!("panic in dispatcher work: {}", msg);
        Err(ExecutionError::Panic(msg))
    });
    if let Err(err) = outcome {
        // Only the first error is kept.
        if err_tx.try_send(err).is_err() {
            debug!("dispatcher already holds an error");
        }
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
