// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Cancellable run context shared by every node of an execution

use crate::exec::error::ExecutionError;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Cooperative cancellation handle.
///
/// Cancellation closes the channel returned by [`RunContext::done`], so it can
/// take part in a `crossbeam_channel::select!` next to other signals. A
/// context with a deadline cancels itself with `DeadlineExceeded` once the
/// deadline passes. Child contexts are cancelled together with their parent
/// and rely on the parent's deadline timer.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    done_rx: Receiver<()>,
    deadline: Option<Instant>,
    // Keeps the parent, and with it the deadline timer, alive.
    _parent: Option<Arc<Inner>>,
}

struct State {
    done_tx: Option<Sender<()>>,
    err: Option<ExecutionError>,
    children: Vec<Weak<Inner>>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.inner.state.lock().err)
            .finish()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::background()
    }
}

impl RunContext {
    /// A context that is only ever cancelled explicitly
    pub fn background() -> Self {
        Self::build(None)
    }

    /// A context cancelled with `DeadlineExceeded` at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    fn build(deadline: Option<Instant>) -> Self {
        let ctx = Self::new_inner(deadline, None);
        if let Some(deadline) = deadline {
            ctx.spawn_deadline_timer(deadline);
        }
        ctx
    }

    fn new_inner(deadline: Option<Instant>, parent: Option<Arc<Inner>>) -> Self {
        let (done_tx, done_rx) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    done_tx: Some(done_tx),
                    err: None,
                    children: Vec::new(),
                }),
                done_rx,
                deadline,
                _parent: parent,
            }),
        }
    }

    fn spawn_deadline_timer(&self, deadline: Instant) {
        let weak = Arc::downgrade(&self.inner);
        let done = self.inner.done_rx.clone();
        thread::spawn(move || {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(RecvTimeoutError::Timeout) = done.recv_timeout(remaining) {
                if let Some(inner) = weak.upgrade() {
                    RunContext { inner }.cancel_with(ExecutionError::DeadlineExceeded);
                }
            }
        });
    }

    /// Derive a context that is cancelled when `self` is cancelled.
    pub fn child(&self) -> Self {
        let child = Self::new_inner(self.inner.deadline, Some(self.inner.clone()));
        let parent_err = {
            let mut state = self.inner.state.lock();
            if state.err.is_none() {
                state.children.retain(|c| c.strong_count() > 0);
                state.children.push(Arc::downgrade(&child.inner));
            }
            state.err.clone()
        };
        if let Some(err) = parent_err {
            child.cancel_with(err);
        }
        child
    }

    /// Cancel the context with `Canceled`
    pub fn cancel(&self) {
        self.cancel_with(ExecutionError::Canceled);
    }

    /// Cancel the context, recording `err` as the reason. Only the first
    /// cancellation is recorded.
    pub fn cancel_with(&self, err: ExecutionError) {
        let children = {
            let mut state = self.inner.state.lock();
            if state.err.is_some() {
                return;
            }
            state.err = Some(err.clone());
            // Dropping the sender closes the done channel.
            state.done_tx.take();
            std::mem::take(&mut state.children)
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            RunContext { inner: child }.cancel_with(err.clone());
        }
    }

    /// Channel that becomes disconnected once the context is done
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done_rx
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The cancellation reason, if the context is done
    pub fn err(&self) -> Option<ExecutionError> {
        if let Some(err) = self.inner.state.lock().err.clone() {
            return Some(err);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.cancel_with(ExecutionError::DeadlineExceeded);
                self.inner.state.lock().err.clone()
            }
            _ => None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Block until the context is done or `timeout` elapses. Returns true if done.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.inner.done_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_done(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::select;

    #[test]
    fn test_cancel_closes_done_channel() {
        let ctx = RunContext::background();
        assert!(!ctx.is_done());

        ctx.cancel();
        assert!(ctx.done().recv().is_err());
        assert_eq!(ctx.err(), Some(ExecutionError::Canceled));
    }

    #[test]
    fn test_first_cancellation_wins() {
        let ctx = RunContext::background();
        ctx.cancel_with(ExecutionError::Internal("first".into()));
        ctx.cancel();
        assert_eq!(ctx.err(), Some(ExecutionError::Internal("first".into())));
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = RunContext::background();
        let child = parent.child();
        parent.cancel();
        assert!(child.wait_timeout(Duration::from_secs(1)));
        assert_eq!(child.err(), Some(ExecutionError::Canceled));
    }

    #[test]
    fn test_child_of_cancelled_parent_is_cancelled() {
        let parent = RunContext::background();
        parent.cancel();
        assert!(parent.child().is_done());
    }

    #[test]
    fn test_cancelling_child_leaves_parent() {
        let parent = RunContext::background();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_done());
    }

    #[test]
    fn test_child_deadline_fires_through_parent() {
        let child = RunContext::with_timeout(Duration::from_millis(20)).child();
        assert!(child.deadline().is_some());
        select! {
            recv(child.done()) -> _ => {}
            default(Duration::from_secs(5)) => panic!("deadline never reached the child"),
        }
        assert_eq!(child.err(), Some(ExecutionError::DeadlineExceeded));
    }

    #[test]
    fn test_deadline_exceeded() {
        let ctx = RunContext::with_timeout(Duration::from_millis(20));
        select! {
            recv(ctx.done()) -> _ => {}
            default(Duration::from_secs(5)) => panic!("deadline never fired"),
        }
        assert_eq!(ctx.err(), Some(ExecutionError::DeadlineExceeded));
    }
}
