// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-product reassembly state (spec.md §4.8 state machine).

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::product::ProductIndex;

/// Where a single product sits in the BOP/OPEN/COMPLETE state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Data has arrived but no BOP yet; a `BOP_REQ` has been issued.
    AwaitingBop,
    /// BOP has been observed (or served via `RETX_BOP`); accumulating data.
    Open,
    /// All bytes and EOP observed; `onEOP` has fired.
    Complete,
}

/// Reassembly state for one in-flight product.
pub struct ProductState {
    pub index: ProductIndex,
    pub phase: Phase,
    pub prod_size: Option<u32>,
    pub buffer: Option<Arc<Mutex<Vec<u8>>>>,
    /// Sorted, merged list of `[start, end)` byte ranges received so far.
    pub received: Vec<(u32, u32)>,
    pub eop_seen: bool,
    pub bop_seen_at: Instant,
    /// Set once a request for this product has been queued, to avoid
    /// flooding duplicate `RETX_REQ`/`BOP_REQ` traffic.
    pub request_in_flight: bool,
}

impl ProductState {
    pub fn new_awaiting_bop(index: ProductIndex) -> Self {
        Self {
            index,
            phase: Phase::AwaitingBop,
            prod_size: None,
            buffer: None,
            received: Vec::new(),
            eop_seen: false,
            bop_seen_at: Instant::now(),
            request_in_flight: true,
        }
    }

    pub fn new_open(index: ProductIndex, prod_size: u32, buffer: Option<Arc<Mutex<Vec<u8>>>>) -> Self {
        Self {
            index,
            phase: Phase::Open,
            prod_size: Some(prod_size),
            buffer,
            received: Vec::new(),
            eop_seen: false,
            bop_seen_at: Instant::now(),
            request_in_flight: false,
        }
    }

    /// Record `[offset, offset+len)` as received, merging into existing
    /// intervals so gap computation stays cheap.
    pub fn mark_received(&mut self, offset: u32, len: u32) {
        if len == 0 {
            return;
        }
        let new_start = offset;
        let new_end = offset.saturating_add(len);
        self.received.push((new_start, new_end));
        self.received.sort_unstable_by_key(|r| r.0);
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.received.len());
        for (start, end) in self.received.drain(..) {
            if let Some(last) = merged.last_mut() {
                if start <= last.1 {
                    last.1 = last.1.max(end);
                    continue;
                }
            }
            merged.push((start, end));
        }
        self.received = merged;
    }

    pub fn total_received(&self) -> u32 {
        self.received.iter().map(|(s, e)| e - s).sum()
    }

    /// Gaps within `[0, prod_size)`, coalesced (spec.md §4.8).
    pub fn gaps(&self) -> Vec<(u32, u32)> {
        let Some(prod_size) = self.prod_size else {
            return Vec::new();
        };
        let mut gaps = Vec::new();
        let mut cursor = 0u32;
        for (start, end) in &self.received {
            if *start > cursor {
                gaps.push((cursor, start - cursor));
            }
            cursor = cursor.max(*end);
        }
        if cursor < prod_size {
            gaps.push((cursor, prod_size - cursor));
        }
        gaps
    }

    pub fn is_fully_received(&self) -> bool {
        self.prod_size.is_some() && self.gaps().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_adjacent_and_overlapping_ranges() {
        let mut s = ProductState::new_open(ProductIndex(0), 3000, None);
        s.mark_received(0, 1460);
        s.mark_received(1460, 1460);
        s.mark_received(2920, 80);
        assert_eq!(s.received, vec![(0, 3000)]);
        assert!(s.gaps().is_empty());
        assert!(s.is_fully_received());
    }

    #[test]
    fn detects_single_gap() {
        let mut s = ProductState::new_open(ProductIndex(0), 3000, None);
        s.mark_received(0, 1460);
        s.mark_received(2920, 80);
        assert_eq!(s.gaps(), vec![(1460, 1460)]);
    }
}
