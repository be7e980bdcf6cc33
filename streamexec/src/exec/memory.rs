// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Memory accounting shared by every node of an execution
//!
//! A single [`Allocator`] is handed to every node replica. Buffer allocations
//! and releases are accounted against it; accounting is additive and must be
//! symmetric, so whatever a node accounts it must eventually give back.

use crate::exec::error::{ExecutionError, Result};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Quota-tracked memory accounting handle
///
/// Cloning an `Allocator` yields another handle onto the same counters.
///
/// # Usage
/// ```ignore
/// let alloc = Allocator::new(Some(100 * 1024 * 1024)); // 100MB limit
///
/// alloc.allocate(1024)?;
/// // ... build buffers ...
/// alloc.free(1024);
/// ```
#[derive(Clone)]
pub struct Allocator {
    /// Maximum allowed memory in bytes, `None` for unlimited
    limit: Option<i64>,

    /// Currently accounted memory
    allocated: Arc<AtomicI64>,

    /// Peak accounted memory
    peak: Arc<AtomicI64>,
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("limit", &self.limit)
            .field("allocated", &self.allocated.load(Ordering::SeqCst))
            .field("peak", &self.peak.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl Allocator {
    /// Create an allocator with the given limit. Non-positive limits mean unlimited.
    pub fn new(limit: Option<i64>) -> Self {
        Self {
            limit: limit.filter(|l| *l > 0),
            allocated: Arc::new(AtomicI64::new(0)),
            peak: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Create an allocator without a limit
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Account `delta` bytes. Positive values allocate, negative values free.
    ///
    /// An allocation that would exceed the limit is rolled back and reported
    /// as `MemoryLimitExceeded`.
    pub fn account(&self, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let current = self.allocated.fetch_add(delta, Ordering::SeqCst);
        let new_total = current + delta;

        if delta > 0 {
            if let Some(limit) = self.limit {
                if new_total > limit {
                    self.allocated.fetch_sub(delta, Ordering::SeqCst);
                    return Err(ExecutionError::MemoryLimitExceeded {
                        limit,
                        requested: new_total,
                    });
                }
            }
            self.peak.fetch_max(new_total, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Allocate bytes from the quota
    pub fn allocate(&self, bytes: usize) -> Result<()> {
        self.account(bytes as i64)
    }

    /// Allocate bytes and return a guard that frees them when dropped
    pub fn reserve(&self, bytes: usize) -> Result<MemoryReservation> {
        self.allocate(bytes)?;
        Ok(MemoryReservation {
            alloc: self.clone(),
            bytes,
        })
    }

    /// Release bytes back to the quota
    pub fn free(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes as i64, Ordering::SeqCst);
    }

    /// Currently accounted bytes
    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::SeqCst)
    }

    /// Peak accounted bytes
    pub fn max_allocated(&self) -> i64 {
        self.peak.load(Ordering::SeqCst)
    }

    /// Configured limit, if any
    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    /// Bytes still available under the limit
    pub fn available(&self) -> Option<i64> {
        self.limit.map(|l| (l - self.allocated()).max(0))
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            limit: self.limit,
            allocated: self.allocated(),
            peak: self.max_allocated(),
        }
    }
}

/// Bytes accounted on an [`Allocator`], released on drop
#[derive(Debug)]
pub struct MemoryReservation {
    alloc: Allocator,
    bytes: usize,
}

impl MemoryReservation {
    /// An empty reservation that accounts nothing
    pub fn empty(alloc: &Allocator) -> Self {
        Self {
            alloc: alloc.clone(),
            bytes: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes
    }

    pub fn alloc(&self) -> &Allocator {
        &self.alloc
    }

    /// Grow the reservation by `bytes`
    pub fn grow(&mut self, bytes: usize) -> Result<()> {
        self.alloc.allocate(bytes)?;
        self.bytes += bytes;
        Ok(())
    }

    /// Merge another reservation on the same allocator into this one
    pub fn absorb(&mut self, mut other: MemoryReservation) {
        self.bytes += other.bytes;
        other.bytes = 0;
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.alloc.free(self.bytes);
        }
    }
}

/// Memory usage statistics
#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub limit: Option<i64>,
    pub allocated: i64,
    pub peak: i64,
}

impl MemoryStats {
    /// Format as human-readable string
    pub fn format_human_readable(&self) -> String {
        let limit = match self.limit {
            Some(limit) => Self::format_bytes(limit),
            None => "unlimited".to_string(),
        };
        format!(
            "Memory: {}/{}, Peak: {}",
            Self::format_bytes(self.allocated),
            limit,
            Self::format_bytes(self.peak)
        )
    }

    fn format_bytes(bytes: i64) -> String {
        const KB: i64 = 1024;
        const MB: i64 = KB * 1024;
        const GB: i64 = MB * 1024;

        if bytes >= GB {
            format!("{:.2}GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2}MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2}KB", bytes as f64 / KB as f64)
        } else {
            format!("{}B", bytes)
        }
    }
}
