// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber registry and authorization control plane (spec.md §4.9).
//!
//! Grounded on the reference crate's `DashMap`-backed registry shape
//! (`core/writer/matched_readers.rs`): a lock-free concurrent map keyed
//! by an opaque identity, read from a data-path thread and written from
//! a control-path thread without a single coarse lock serializing both.
//!
//! The Control Plane and the Sender's Client-Address Pool are separate
//! components, coupled only through the Authorization Channel: a
//! subscriber's client IP is drawn from its own per-subscriber
//! `[minClient, maxClient]` range here, then handed to the Sender by
//! writing it to the channel. This module never touches
//! [`crate::net::ClientAddressPool`] directly.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::net::AuthChannel;

/// Opaque key identifying a subscriber connection, assigned by the
/// caller (e.g. the outer RPC daemon, out of scope here).
pub type SubscriberKey = u64;

#[derive(Debug, Clone)]
struct SubscriberEntry {
    server_addr: SocketAddr,
    vlan_id: u16,
    switch_port_id: u32,
    min_client: Ipv4Addr,
    max_client: Ipv4Addr,
    leased_ip: Option<Ipv4Addr>,
}

/// Process-wide registry mapping a subscriber key to its server
/// rendezvous point (VLAN/port/address) and its leased client IP.
pub struct ControlPlane {
    subscribers: DashMap<SubscriberKey, SubscriberEntry>,
    leased: Mutex<HashSet<Ipv4Addr>>,
    auth: Arc<AuthChannel>,
}

impl ControlPlane {
    pub fn new(auth: Arc<AuthChannel>) -> Self {
        Self {
            subscribers: DashMap::new(),
            leased: Mutex::new(HashSet::new()),
            auth,
        }
    }

    /// Register a new subscriber and the client-IP range `reserve` may
    /// allocate from.
    ///
    /// # Errors
    /// `Error::Inval` if `min_client > max_client`. `Error::Dup` if
    /// `key` is already registered.
    pub fn add(
        &self,
        key: SubscriberKey,
        server_addr: SocketAddr,
        vlan_id: u16,
        switch_port_id: u32,
        min_client: Ipv4Addr,
        max_client: Ipv4Addr,
    ) -> Result<()> {
        if u32::from(min_client) > u32::from(max_client) {
            return Err(Error::Inval(format!(
                "client range {min_client}-{max_client} is empty"
            )));
        }
        match self.subscribers.entry(key) {
            Entry::Occupied(_) => Err(Error::Dup),
            Entry::Vacant(v) => {
                v.insert(SubscriberEntry {
                    server_addr,
                    vlan_id,
                    switch_port_id,
                    min_client,
                    max_client,
                    leased_ip: None,
                });
                Ok(())
            }
        }
    }

    /// Look up a subscriber's server rendezvous point.
    pub fn get(&self, key: SubscriberKey) -> Result<(SocketAddr, u16, u32)> {
        let entry = self.subscribers.get(&key).ok_or(Error::NoEnt)?;
        Ok((entry.server_addr, entry.vlan_id, entry.switch_port_id))
    }

    /// Update the port of a subscriber's server rendezvous point.
    pub fn set(&self, key: SubscriberKey, port: u16) -> Result<()> {
        let mut entry = self.subscribers.get_mut(&key).ok_or(Error::NoEnt)?;
        entry.server_addr.set_port(port);
        Ok(())
    }

    /// Allocate the lowest unused address in `key`'s `[minClient,
    /// maxClient]` range and authorize it over the Authorization
    /// Channel, so the Sender will admit the subscriber's future TCP
    /// retransmission connection.
    ///
    /// # Errors
    /// `Error::NoEnt` if `key` is unregistered. `Error::Dup` if `key`
    /// already holds a reservation. `Error::Busy` if the range is
    /// exhausted.
    pub fn reserve(&self, key: SubscriberKey) -> Result<Ipv4Addr> {
        let mut entry = self.subscribers.get_mut(&key).ok_or(Error::NoEnt)?;
        if entry.leased_ip.is_some() {
            return Err(Error::Dup);
        }

        let addr = {
            let mut leased = self.leased.lock();
            let addr = client_range(entry.min_client, entry.max_client)
                .find(|a| !leased.contains(a))
                .ok_or(Error::Busy)?;
            leased.insert(addr);
            addr
        };

        if let Err(e) = self.auth.send(addr) {
            self.leased.lock().remove(&addr);
            return Err(e);
        }
        entry.leased_ip = Some(addr);
        Ok(addr)
    }

    /// Return `client_ip` to `key`'s range.
    ///
    /// # Errors
    /// `Error::NoEnt` if `key` is unregistered. `Error::Inval` if
    /// `client_ip` is not the address currently leased to `key`.
    pub fn release(&self, key: SubscriberKey, client_ip: Ipv4Addr) -> Result<()> {
        let mut entry = self.subscribers.get_mut(&key).ok_or(Error::NoEnt)?;
        match entry.leased_ip {
            Some(addr) if addr == client_ip => {
                entry.leased_ip = None;
                drop(entry);
                self.leased.lock().remove(&client_ip);
                Ok(())
            }
            _ => Err(Error::Inval(format!(
                "{client_ip} is not leased to subscriber {key}"
            ))),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

fn client_range(min: Ipv4Addr, max: Ipv4Addr) -> impl Iterator<Item = Ipv4Addr> {
    (u32::from(min)..=u32::from(max)).map(Ipv4Addr::from)
}
