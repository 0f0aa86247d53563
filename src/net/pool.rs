// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CIDR-scoped client address leasing pool (spec.md §4.4).
//!
//! Grounded on the reference crate's `discovery_server/client.rs`
//! connection-state-plus-config struct shape, adapted to the simpler
//! single-mutex contract spec.md §5 requires: one lock guards both the
//! leased set and the allow set, since `reserve`/`release`/`allow` all
//! need to observe each other atomically.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::{Contains, Ipv4Net};
use parking_lot::Mutex;

use crate::error::{Error, Result};

struct State {
    leased: HashSet<Ipv4Addr>,
    allowed: HashSet<Ipv4Addr>,
}

/// Leases IPv4 addresses out of a configured CIDR block to subscribers,
/// and separately tracks which leased addresses are authorized to
/// retransmit-connect back to the sender.
pub struct ClientAddressPool {
    net: Ipv4Net,
    state: Mutex<State>,
}

impl ClientAddressPool {
    /// Build a pool over `net`'s host addresses. For prefixes shorter
    /// than /31, network and broadcast addresses are never leased; /31
    /// and /32 blocks lease every address in the block (RFC 3021).
    pub fn new(net: Ipv4Net) -> Result<Self> {
        if net.prefix_len() == 0 {
            return Err(Error::Inval("CIDR block has no defined host range".into()));
        }
        Ok(Self {
            net,
            state: Mutex::new(State {
                leased: HashSet::new(),
                allowed: HashSet::new(),
            }),
        })
    }

    /// Lease the next unused address in the block, marking it both
    /// leased and allowed.
    ///
    /// # Errors
    /// `Error::Busy` if every address in the block is currently leased.
    pub fn get_available(&self) -> Result<Ipv4Addr> {
        let mut state = self.state.lock();
        for addr in self.net.hosts() {
            if !state.leased.contains(&addr) {
                state.leased.insert(addr);
                state.allowed.insert(addr);
                return Ok(addr);
            }
        }
        Err(Error::Busy)
    }

    /// Release a previously leased address back into the pool. Does
    /// not revoke its authorization: a late retransmission request
    /// must not be rejected due to a race with the release.
    ///
    /// # Errors
    /// `Error::NoEnt` if `addr` was not currently leased from this pool.
    pub fn release(&self, addr: Ipv4Addr) -> Result<()> {
        let mut state = self.state.lock();
        if !state.leased.remove(&addr) {
            return Err(Error::NoEnt);
        }
        Ok(())
    }

    /// Admit `addr` as authorized to open a retransmission connection,
    /// without reserving it as leased (the Control Plane calls this for
    /// addresses it leases from its own per-subscriber range).
    ///
    /// # Errors
    /// `Error::Inval` if `addr` falls outside this pool's configured CIDR.
    pub fn allow(&self, addr: Ipv4Addr) -> Result<()> {
        if !self.net.contains(&addr) {
            return Err(Error::Inval(format!("{addr} is not in {}", self.net)));
        }
        self.state.lock().allowed.insert(addr);
        Ok(())
    }

    /// Wait-free membership check (spec.md §4.4: must not block behind
    /// lease churn). A `parking_lot::Mutex` on an uncontended, short
    /// critical section satisfies this in practice; no blocking syscall
    /// is ever made while held.
    pub fn is_allowed(&self, addr: Ipv4Addr) -> bool {
        self.state.lock().allowed.contains(&addr)
    }

    pub fn leased_count(&self) -> usize {
        self.state.lock().leased.len()
    }

    pub fn capacity(&self) -> usize {
        self.net.hosts().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn pool() -> ClientAddressPool {
        ClientAddressPool::new(Ipv4Net::from_str("10.1.2.0/30").unwrap()).unwrap()
    }

    #[test]
    fn leases_distinct_addresses_until_exhausted() {
        let pool = pool();
        // /30 has exactly 2 usable hosts
        let a = pool.get_available().unwrap();
        let b = pool.get_available().unwrap();
        assert_ne!(a, b);
        assert!(matches!(pool.get_available(), Err(Error::Busy)));
    }

    #[test]
    fn release_makes_address_available_again() {
        let pool = pool();
        let a = pool.get_available().unwrap();
        let _b = pool.get_available().unwrap();
        pool.release(a).unwrap();
        let c = pool.get_available().unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn release_of_an_unleased_address_is_noent() {
        let pool = pool();
        let addr = Ipv4Addr::new(10, 1, 2, 1);
        assert!(matches!(pool.release(addr), Err(Error::NoEnt)));
    }

    #[test]
    fn allow_admits_an_address_without_leasing_it() {
        let pool = pool();
        let addr = Ipv4Addr::new(10, 1, 2, 1);
        assert!(!pool.is_allowed(addr));
        pool.allow(addr).unwrap();
        assert!(pool.is_allowed(addr));
        // Still not leased: a later getAvailable can still hand it out.
        assert_eq!(pool.get_available().unwrap(), addr);
    }

    #[test]
    fn allow_rejects_an_address_outside_the_subnet() {
        let pool = pool();
        let outsider = Ipv4Addr::new(10, 1, 3, 1);
        assert!(matches!(pool.allow(outsider), Err(Error::Inval(_))));
    }

    #[test]
    fn get_available_marks_leased_and_allowed() {
        let pool = pool();
        let addr = pool.get_available().unwrap();
        assert!(pool.is_allowed(addr));
    }

    #[test]
    fn release_does_not_revoke_authorization() {
        let pool = pool();
        let addr = pool.get_available().unwrap();
        pool.release(addr).unwrap();
        assert!(pool.is_allowed(addr));
    }

    #[test]
    fn rejects_unspecified_prefix() {
        let whole_internet = Ipv4Net::from_str("0.0.0.0/0").unwrap();
        assert!(matches!(
            ClientAddressPool::new(whole_internet),
            Err(Error::Inval(_))
        ));
    }

    #[test]
    fn slash_31_leases_both_addresses() {
        let pool = ClientAddressPool::new(Ipv4Net::from_str("10.1.2.4/31").unwrap()).unwrap();
        let a = pool.get_available().unwrap();
        let b = pool.get_available().unwrap();
        assert_ne!(a, b);
        assert!(matches!(pool.get_available(), Err(Error::Busy)));
    }
}
