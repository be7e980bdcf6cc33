// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Bookkeeping for transformations with more than one parent

use crate::exec::error::ExecutionError;
use crate::exec::node::DatasetId;
use crate::exec::time::Time;

#[derive(Debug, Clone)]
struct ParentState {
    id: DatasetId,
    mark: Time,
    processing_time: Time,
    finished: bool,
}

impl ParentState {
    fn new(id: DatasetId) -> Self {
        Self {
            id,
            mark: Time::MIN,
            processing_time: Time::MIN,
            finished: false,
        }
    }
}

/// Tracks watermarks, processing times and completion of every parent.
///
/// Marks are merged by minimum over the parents that have not finished, and
/// a merged mark is only reported when it advances. Completion is reported
/// exactly once, after the last parent finished, carrying the first error
/// any parent finished with.
#[derive(Debug, Clone)]
pub struct ParentStates {
    parents: Vec<ParentState>,
    mark: Time,
    processing_time: Time,
    err: Option<ExecutionError>,
    reported: bool,
}

impl ParentStates {
    pub fn new(parents: &[DatasetId]) -> Self {
        let mut states = Self {
            parents: Vec::with_capacity(parents.len()),
            mark: Time::MIN,
            processing_time: Time::MIN,
            err: None,
            reported: false,
        };
        for id in parents {
            states.state_mut(*id);
        }
        states
    }

    // Parents not declared up front are tracked from their first call.
    fn state_mut(&mut self, id: DatasetId) -> &mut ParentState {
        let idx = match self.parents.iter().position(|p| p.id == id) {
            Some(idx) => idx,
            None => {
                self.parents.push(ParentState::new(id));
                self.parents.len() - 1
            }
        };
        &mut self.parents[idx]
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn watermark(&self) -> Time {
        self.mark
    }

    pub fn processing_time(&self) -> Time {
        self.processing_time
    }

    /// Record a watermark from `id`. Returns the merged watermark if it advanced.
    pub fn update_watermark(&mut self, id: DatasetId, mark: Time) -> Option<Time> {
        let state = self.state_mut(id);
        state.mark = state.mark.max(mark);
        let min = self.min_of(|p| p.mark)?;
        if min > self.mark {
            self.mark = min;
            Some(min)
        } else {
            None
        }
    }

    /// Record a processing time from `id`. Returns the merged time if it advanced.
    pub fn update_processing_time(&mut self, id: DatasetId, time: Time) -> Option<Time> {
        let state = self.state_mut(id);
        state.processing_time = state.processing_time.max(time);
        let min = self.min_of(|p| p.processing_time)?;
        if min > self.processing_time {
            self.processing_time = min;
            Some(min)
        } else {
            None
        }
    }

    fn min_of(&self, f: impl Fn(&ParentState) -> Time) -> Option<Time> {
        self.parents.iter().filter(|p| !p.finished).map(f).min()
    }

    /// Record that `id` finished.
    ///
    /// Returns `Some(err)` once every parent has finished, `err` being the
    /// first error reported by any of them. Later calls return `None`.
    pub fn finish(
        &mut self,
        id: DatasetId,
        err: Option<ExecutionError>,
    ) -> Option<Option<ExecutionError>> {
        if self.err.is_none() {
            self.err = err;
        }
        self.state_mut(id).finished = true;
        if self.reported || !self.all_finished() {
            return None;
        }
        self.reported = true;
        Some(self.err.clone())
    }

    pub fn is_finished(&self, id: DatasetId) -> bool {
        self.parents.iter().any(|p| p.id == id && p.finished)
    }

    pub fn all_finished(&self) -> bool {
        self.parents.iter().all(|p| p.finished)
    }

    /// First error reported by a parent so far
    pub fn err(&self) -> Option<&ExecutionError> {
        self.err.as_ref()
    }
}
