// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast egress pacing (spec.md §4.1).
//!
//! Grounded on the reference crate's `congestion/token_bucket.rs` shape
//! (a struct wrapping an `Instant` plus a configured rate, refilled by
//! elapsed wall time), simplified to the leaky-bucket-without-burst
//! contract spec.md asks for: "sleep for `max(0, S*8/R - elapsed)`,
//! overshoot is not compensated." This sits on the hot path of every
//! outbound multicast packet, so `pace()` performs no heap allocation
//! and no logging.

use std::thread;
use std::time::{Duration, Instant};

/// Paces outbound multicast bytes to a configured bits-per-second rate.
#[derive(Debug)]
pub struct RateShaper {
    rate_bps: u64,
    last_send: Option<Instant>,
}

impl RateShaper {
    /// Create a shaper targeting `rate_bps` bits per second. A rate of
    /// zero disables pacing (every call returns immediately).
    pub fn new(rate_bps: u64) -> Self {
        Self {
            rate_bps,
            last_send: None,
        }
    }

    /// Update the target rate (e.g. on reconfiguration). Takes effect on
    /// the next call to `pace`.
    pub fn set_rate(&mut self, rate_bps: u64) {
        self.rate_bps = rate_bps;
    }

    pub fn rate_bps(&self) -> u64 {
        self.rate_bps
    }

    /// Block, if necessary, so that sending `packet_len` bytes now keeps
    /// the long-run egress rate at approximately `rate_bps`. Must not
    /// allocate or log (hot path, spec.md §4.1).
    pub fn pace(&mut self, packet_len: usize) {
        if self.rate_bps == 0 {
            self.last_send = Some(Instant::now());
            return;
        }

        let ideal = Duration::from_secs_f64(packet_len as f64 * 8.0 / self.rate_bps as f64);
        let now = Instant::now();
        if let Some(prev) = self.last_send {
            let elapsed = now.duration_since(prev);
            if elapsed < ideal {
                thread::sleep(ideal - elapsed);
            }
        }
        // Overshoot is not compensated: the next interval always measures
        // from "now", not from a credit ledger (no burst accounting).
        self.last_send = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_disables_pacing() {
        let mut shaper = RateShaper::new(0);
        let start = Instant::now();
        shaper.pace(1_000_000);
        shaper.pace(1_000_000);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn paces_to_approximately_the_target_rate() {
        // 8000 bits/sec => 1000 bytes takes ~1s; use a small packet so the
        // test doesn't take a full second.
        let mut shaper = RateShaper::new(8_000); // 1000 bytes/sec
        shaper.pace(100); // primes last_send, no sleep expected (first call)
        let start = Instant::now();
        shaper.pace(100); // should sleep ~100ms
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(80), "elapsed={elapsed:?}");
        assert!(elapsed <= Duration::from_millis(300), "elapsed={elapsed:?}");
    }

    #[test]
    fn first_call_never_blocks() {
        let mut shaper = RateShaper::new(1); // absurdly slow rate
        let start = Instant::now();
        shaper.pace(1);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn set_rate_takes_effect_on_next_pace() {
        let mut shaper = RateShaper::new(8_000);
        shaper.pace(100);
        shaper.set_rate(0);
        let start = Instant::now();
        shaper.pace(10_000_000);
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
