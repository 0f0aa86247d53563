// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded-concern-free FIFO of missed-product indices (spec.md §4.3).
//!
//! A `parking_lot::Mutex<VecDeque<_>>` plus a `Condvar`, the same shape
//! the reference crate uses for its repair queue (`congestion/repair_queue.rs`)
//! and its low-latency wake primitive (`engine/wake.rs`).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::product::ProductIndex;

struct Inner {
    items: Mutex<VecDeque<ProductIndex>>,
    not_empty: Condvar,
    canceled: Mutex<bool>,
}

/// Strict-FIFO, unbounded queue of product indices awaiting
/// retransmission request.
#[derive(Clone)]
pub struct ProductIndexQueue {
    inner: Arc<Inner>,
}

impl ProductIndexQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::new()),
                not_empty: Condvar::new(),
                canceled: Mutex::new(false),
            }),
        }
    }

    /// Enqueue an index. Duplicates are permitted (spec.md §4.3).
    pub fn add(&self, index: ProductIndex) {
        let mut items = self.inner.items.lock();
        items.push_back(index);
        self.inner.not_empty.notify_one();
    }

    /// Non-blocking dequeue. Returns `Err(NoEnt)` if empty.
    pub fn remove_no_wait(&self) -> Result<ProductIndex> {
        let mut items = self.inner.items.lock();
        items.pop_front().ok_or(Error::NoEnt)
    }

    /// Blocking dequeue: waits for an entry or until `cancel()` is called,
    /// in which case it returns `Err(Canceled)`.
    pub fn remove(&self) -> Result<ProductIndex> {
        let mut items = self.inner.items.lock();
        loop {
            if let Some(idx) = items.pop_front() {
                return Ok(idx);
            }
            if *self.inner.canceled.lock() {
                return Err(Error::Canceled);
            }
            self.inner.not_empty.wait(&mut items);
        }
    }

    /// Blocking dequeue with a timeout; `Err(Timeout)` if none arrives in
    /// time (used by the timeout thread's periodic scan, spec.md §4.8).
    pub fn remove_timeout(&self, timeout: Duration) -> Result<ProductIndex> {
        let mut items = self.inner.items.lock();
        if let Some(idx) = items.pop_front() {
            return Ok(idx);
        }
        if *self.inner.canceled.lock() {
            return Err(Error::Canceled);
        }
        let result = self.inner.not_empty.wait_for(&mut items, timeout);
        if let Some(idx) = items.pop_front() {
            return Ok(idx);
        }
        if *self.inner.canceled.lock() {
            return Err(Error::Canceled);
        }
        if result.timed_out() {
            Err(Error::Timeout)
        } else {
            Err(Error::NoEnt)
        }
    }

    /// Number of items currently queued.
    pub fn count(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Release all blocked waiters with `Canceled`. Idempotent.
    pub fn cancel(&self) {
        *self.inner.canceled.lock() = true;
        self.inner.not_empty.notify_all();
    }
}

impl Default for ProductIndexQueue {
    fn default() -> Self {
        Self::new()
    }
}
