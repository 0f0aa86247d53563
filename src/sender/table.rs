// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The Sender's retained product table (spec.md §4.7, §5).
//!
//! Read-mostly: new products take the writer lock once per product;
//! retransmission workers take the reader lock once per request. Grounded
//! on the reference crate's `parking_lot::RwLock`-protected graph state
//! (`rmw/graph.rs`) for the same new-products-rare/reads-frequent shape.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::product::ProductIndex;

/// A product retained for the sender's retransmission window.
pub struct RetainedProduct {
    pub index: ProductIndex,
    pub bytes: Arc<[u8]>,
    pub meta: Arc<[u8]>,
}

/// Bounded ring of the `retx_window` most recently sent products.
pub struct RetainedTable {
    entries: RwLock<VecDeque<RetainedProduct>>,
    capacity: usize,
}

impl RetainedTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Insert a newly sent product, evicting the oldest if at capacity.
    pub fn insert(&self, product: RetainedProduct) {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(product);
    }

    /// Look up a retained product by index.
    pub fn get(&self, index: ProductIndex) -> Option<(Arc<[u8]>, Arc<[u8]>)> {
        let entries = self.entries.read();
        entries
            .iter()
            .find(|p| p.index == index)
            .map(|p| (Arc::clone(&p.bytes), Arc::clone(&p.meta)))
    }

    pub fn contains(&self, index: ProductIndex) -> bool {
        self.entries.read().iter().any(|p| p.index == index)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(i: u32, byte: u8) -> RetainedProduct {
        RetainedProduct {
            index: ProductIndex(i),
            bytes: Arc::from(vec![byte; 4]),
            meta: Arc::from(Vec::<u8>::new()),
        }
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let table = RetainedTable::new(2);
        table.insert(product(0, 0xAA));
        table.insert(product(1, 0xBB));
        table.insert(product(2, 0xCC));
        assert!(!table.contains(ProductIndex(0)));
        assert!(table.contains(ProductIndex(1)));
        assert!(table.contains(ProductIndex(2)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn get_returns_stored_bytes() {
        let table = RetainedTable::new(4);
        table.insert(product(5, 0x42));
        let (bytes, _meta) = table.get(ProductIndex(5)).unwrap();
        assert_eq!(&*bytes, &[0x42u8; 4][..]);
    }
}
