// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! FMTP Receiver (spec.md §4.8): multicast reassembly plus the
//! retransmission client.

mod state;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpStream, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::future::Future;
use crate::product::{ProductIndex, ProductIndexMap, ProductIndexQueue};
use crate::wire::{BopPayload, PacketFlags, PacketHeader, HEADER_LEN};

use state::{Phase, ProductState};

/// Application callbacks invoked from both the multicast and
/// retransmission threads (spec.md §4.8, §6) — implementations must be
/// thread-safe.
pub trait ReceiverCallbacks: Send + Sync {
    /// A product's BOP has been observed (directly or via `RETX_BOP`).
    /// Returning `None` tells the receiver to ignore the product; its
    /// data is dropped silently.
    fn on_bop(&self, index: ProductIndex, prod_size: u32, meta: &[u8]) -> Option<Arc<Mutex<Vec<u8>>>>;
    /// The product completed: the reassembly buffer is byte-exact.
    fn on_eop(&self, index: ProductIndex);
    /// The product could not be recovered within `retx_timeout` or was
    /// rejected by the sender as evicted.
    fn on_missed(&self, index: ProductIndex);
}

pub struct ReceiverConfig {
    pub feed_id: u32,
    pub multicast_addr: SocketAddrV4,
    pub sender_retx_addr: SocketAddr,
    pub retx_timeout: Duration,
    pub map_dir: PathBuf,
    pub max_sigs: u32,
}

struct Shared {
    products: Mutex<HashMap<u32, ProductState>>,
    dedup_map: Mutex<ProductIndexMap>,
    requests: ProductIndexQueue,
    retx_stream: Mutex<Option<TcpStream>>,
    callbacks: Arc<dyn ReceiverCallbacks>,
    config: ReceiverConfig,
}

/// FMTP receiver: joins the multicast group, reassembles products, and
/// drives a persistent TCP connection for gap-filling retransmission.
pub struct Receiver {
    shared: Arc<Shared>,
    socket: UdpSocket,
}

impl Receiver {
    pub fn new(config: ReceiverConfig, callbacks: Arc<dyn ReceiverCallbacks>) -> Result<Self> {
        let dedup_map =
            ProductIndexMap::open_for_writing(&config.map_dir, config.feed_id, config.max_sigs)?;

        let socket = UdpSocket::bind(SocketAddrV4::new(
            std::net::Ipv4Addr::UNSPECIFIED,
            config.multicast_addr.port(),
        ))
        .map_err(Error::System)?;
        socket
            .join_multicast_v4(config.multicast_addr.ip(), &std::net::Ipv4Addr::UNSPECIFIED)
            .map_err(Error::System)?;
        socket.set_read_timeout(Some(Duration::from_millis(200))).map_err(Error::System)?;

        let shared = Arc::new(Shared {
            products: Mutex::new(HashMap::new()),
            dedup_map: Mutex::new(dedup_map),
            requests: ProductIndexQueue::new(),
            retx_stream: Mutex::new(None),
            callbacks,
            config,
        });

        Ok(Self { shared, socket })
    }

    /// Spawn the multicast receiver, retransmission client, and timeout
    /// threads. Returns their handles; keep them alive for the
    /// receiver's lifetime.
    pub fn spawn_services(self) -> (Future<()>, Future<()>, Future<()>) {
        let Self { shared, socket } = self;

        let multicast = {
            let shared = Arc::clone(&shared);
            Future::spawn("fmtp-receiver-multicast", move |flag| {
                run_multicast_loop(&shared, socket, flag);
            })
        };
        let retx_client = {
            let shared = Arc::clone(&shared);
            Future::spawn("fmtp-receiver-retx-client", move |flag| {
                run_retx_client_loop(&shared, flag);
            })
        };
        let timeout = {
            let shared = Arc::clone(&shared);
            Future::spawn("fmtp-receiver-timeout", move |flag| {
                run_timeout_loop(&shared, flag);
            })
        };
        (multicast, retx_client, timeout)
    }
}

fn run_multicast_loop(shared: &Arc<Shared>, socket: UdpSocket, flag: crate::future::StopFlag) {
    let mut buf = vec![0u8; 65536];
    while !flag.should_stop() {
        match socket.recv_from(&mut buf) {
            Ok((n, _peer)) => handle_multicast_packet(shared, &buf[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::warn!("fmtp receiver: multicast recv failed: {e}");
                continue;
            }
        }
    }
}

fn handle_multicast_packet(shared: &Arc<Shared>, datagram: &[u8]) {
    let header = match PacketHeader::decode(datagram) {
        Ok(h) => h,
        Err(e) => {
            log::debug!("fmtp receiver: dropping malformed packet: {e}");
            return;
        }
    };
    let payload = &datagram[HEADER_LEN..];
    let index = ProductIndex(header.prod_index);

    match header.flags {
        PacketFlags::BOP => handle_bop(shared, index, payload),
        PacketFlags::MEM_DATA => handle_data(shared, index, header.seq_num, payload),
        PacketFlags::EOP => handle_eop(shared, index),
        _ => log::debug!("fmtp receiver: unexpected flag {:?} on multicast socket", header.flags),
    }
}

fn already_seen(shared: &Shared, index: ProductIndex) -> bool {
    // Restart-dedup: the receiver's own persistent map remembers indices
    // it has already delivered, independent of the external product
    // queue's signature dedup (spec.md §4.8 dedup is a supplemental
    // check this spec leaves the implementer free to source from either
    // store; we use our own map since it is always available locally).
    shared.dedup_map.lock().get(index).is_ok()
}

fn handle_bop(shared: &Arc<Shared>, index: ProductIndex, payload: &[u8]) {
    if already_seen(shared, index) {
        log::debug!("fmtp receiver: ignoring duplicate BOP for {index}");
        return;
    }
    let bop = match BopPayload::decode(payload) {
        Ok(b) => b,
        Err(e) => {
            log::debug!("fmtp receiver: malformed BOP payload for {index}: {e}");
            return;
        }
    };

    let mut products = shared.products.lock();
    if let Some(existing) = products.get(&index.0) {
        if existing.phase != Phase::AwaitingBop {
            return;
        }
    }

    let handle = shared.callbacks.on_bop(index, bop.prod_size, &bop.metadata);
    if handle.is_none() {
        products.remove(&index.0);
        return;
    }
    products.insert(index.0, ProductState::new_open(index, bop.prod_size, handle));
    let _ = shared.dedup_map.lock().put(index, crate::product::Signature::ZERO);
}

fn handle_data(shared: &Arc<Shared>, index: ProductIndex, offset: u32, payload: &[u8]) {
    let mut products = shared.products.lock();
    let state = products.entry(index.0).or_insert_with(|| {
        shared.requests.add(index);
        ProductState::new_awaiting_bop(index)
    });

    if state.phase == Phase::AwaitingBop {
        // Data arrived with no known BOP: §4.8 dictates a BOP_REQ, which
        // `handle_data`'s caller (the queue drain) already triggered via
        // `or_insert_with` above on first sight.
        return;
    }
    if state.phase == Phase::Complete {
        return;
    }
    if let Some(buffer) = &state.buffer {
        let mut buf = buffer.lock();
        let end = offset as usize + payload.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset as usize..end].copy_from_slice(payload);
    }
    state.mark_received(offset, payload.len() as u32);
}

fn handle_eop(shared: &Arc<Shared>, index: ProductIndex) {
    let mut products = shared.products.lock();
    let Some(state) = products.get_mut(&index.0) else {
        return;
    };
    if state.phase != Phase::Open {
        return;
    }
    state.eop_seen = true;

    if state.is_fully_received() {
        state.phase = Phase::Complete;
        products.remove(&index.0);
        drop(products);
        shared.callbacks.on_eop(index);
        send_retx_end(shared, index);
        return;
    }

    if !state.request_in_flight {
        state.request_in_flight = true;
        shared.requests.add(index);
    }
}

fn send_retx_end(shared: &Shared, index: ProductIndex) {
    let mut stream_slot = shared.retx_stream.lock();
    if let Some(stream) = stream_slot.as_mut() {
        let header = PacketHeader::new(index.0, 0, 0, PacketFlags::RETX_END);
        if let Err(e) = write_to_stream(stream, header, &[]) {
            log::debug!("fmtp receiver: failed to send RETX_END for {index}: {e}");
        }
    }
}

fn write_to_stream(stream: &mut TcpStream, header: PacketHeader, payload: &[u8]) -> Result<()> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    stream.write_all(&buf).map_err(Error::System)
}

fn read_from_stream(stream: &mut TcpStream) -> Result<(PacketHeader, Vec<u8>)> {
    let mut header_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_buf).map_err(Error::System)?;
    let header = PacketHeader::decode(&header_buf)?;
    let mut payload = vec![0u8; header.payload_len as usize];
    if !payload.is_empty() {
        stream.read_exact(&mut payload).map_err(Error::System)?;
    }
    Ok((header, payload))
}

fn ensure_connected(shared: &Shared) -> Result<()> {
    let mut slot = shared.retx_stream.lock();
    if slot.is_some() {
        return Ok(());
    }
    let stream = TcpStream::connect(shared.config.sender_retx_addr).map_err(Error::System)?;
    stream.set_nodelay(true).map_err(Error::System)?;
    *slot = Some(stream);
    Ok(())
}

fn run_retx_client_loop(shared: &Arc<Shared>, flag: crate::future::StopFlag) {
    while !flag.should_stop() {
        let index = match shared.requests.remove_timeout(Duration::from_millis(200)) {
            Ok(i) => i,
            Err(Error::Timeout) => continue,
            Err(Error::Canceled) => return,
            Err(_) => continue,
        };

        if let Err(e) = ensure_connected(shared) {
            log::warn!("fmtp receiver: could not reach sender for retransmission: {e}");
            shared.requests.add(index); // retry later
            std::thread::sleep(Duration::from_millis(200));
            continue;
        }

        if let Err(e) = service_one_request(shared, index) {
            log::debug!("fmtp receiver: retransmission round for {index} failed: {e}");
            *shared.retx_stream.lock() = None;
        }
    }
}

fn service_one_request(shared: &Arc<Shared>, index: ProductIndex) -> Result<()> {
    let needs_bop = {
        let products = shared.products.lock();
        products
            .get(&index.0)
            .map(|s| s.phase == Phase::AwaitingBop)
            .unwrap_or(false)
    };

    let mut stream_slot = shared.retx_stream.lock();
    let mut stream = stream_slot.as_mut().ok_or(Error::NoEnt)?;

    if needs_bop {
        write_to_stream(&mut *stream, PacketHeader::new(index.0, 0, 0, PacketFlags::BOP_REQ), &[])?;
        let (reply, payload) = read_from_stream(&mut *stream)?;
        drop(stream_slot);
        return apply_reply(shared, index, reply, payload);
    }

    let gaps = {
        let products = shared.products.lock();
        products.get(&index.0).map(|s| s.gaps()).unwrap_or_default()
    };

    if gaps.is_empty() {
        // EOP was seen but we raced a completion; nothing to request.
        let eop_complete = {
            let products = shared.products.lock();
            products
                .get(&index.0)
                .map(|s| s.eop_seen)
                .unwrap_or(false)
        };
        if eop_complete {
            write_to_stream(&mut *stream, PacketHeader::new(index.0, 0, 0, PacketFlags::EOP_REQ), &[])?;
            let (reply, payload) = read_from_stream(&mut *stream)?;
            drop(stream_slot);
            return apply_reply(shared, index, reply, payload);
        }
        return Ok(());
    }

    for (gap_start, gap_len) in gaps {
        write_to_stream(
            &mut *stream,
            PacketHeader::new(index.0, gap_start, gap_len as u16, PacketFlags::RETX_REQ),
            &[],
        )?;
        let (reply, payload) = read_from_stream(&mut *stream)?;
        // Drop the stream guard before applying the reply: `apply_reply`
        // can complete the product and send RETX_END, which needs to
        // take this same (non-reentrant) lock itself.
        drop(stream_slot);
        let result = apply_reply(shared, index, reply, payload);
        if result.is_err() {
            return result;
        }
        stream_slot = shared.retx_stream.lock();
        stream = stream_slot.as_mut().ok_or(Error::NoEnt)?;
    }
    Ok(())
}

fn apply_reply(shared: &Arc<Shared>, index: ProductIndex, reply: PacketHeader, payload: Vec<u8>) -> Result<()> {
    match reply.flags {
        PacketFlags::RETX_DATA => {
            handle_data(shared, index, reply.seq_num, &payload);
            finalize_if_complete(shared, index);
        }
        PacketFlags::RETX_BOP => {
            let bop = BopPayload::decode(&payload)?;
            let handle = shared.callbacks.on_bop(index, bop.prod_size, &bop.metadata);
            let mut products = shared.products.lock();
            if let Some(h) = handle {
                products.insert(index.0, ProductState::new_open(index, bop.prod_size, Some(h)));
            } else {
                products.remove(&index.0);
            }
        }
        PacketFlags::RETX_EOP => {
            finalize_if_complete(shared, index);
        }
        PacketFlags::RETX_REJ => {
            shared.products.lock().remove(&index.0);
            shared.callbacks.on_missed(index);
        }
        _ => {
            return Err(Error::Inval("unexpected reply flag on retransmission stream".into()));
        }
    }
    Ok(())
}

fn finalize_if_complete(shared: &Arc<Shared>, index: ProductIndex) {
    let mut products = shared.products.lock();
    let Some(state) = products.get_mut(&index.0) else {
        return;
    };
    if state.is_fully_received() && state.eop_seen {
        state.phase = Phase::Complete;
        products.remove(&index.0);
        drop(products);
        shared.callbacks.on_eop(index);
        send_retx_end(shared, index);
    }
}

fn run_timeout_loop(shared: &Arc<Shared>, flag: crate::future::StopFlag) {
    while !flag.should_stop() {
        std::thread::sleep(Duration::from_millis(250));
        let expired: Vec<ProductIndex> = {
            let products = shared.products.lock();
            products
                .values()
                .filter(|s| s.phase != Phase::Complete && s.bop_seen_at.elapsed() > shared.config.retx_timeout)
                .map(|s| s.index)
                .collect()
        };
        for index in expired {
            shared.products.lock().remove(&index.0);
            log::info!("fmtp receiver: product {index} timed out, declaring unrecoverable");
            shared.callbacks.on_missed(index);
            send_retx_end(shared, index);
        }
    }
}
