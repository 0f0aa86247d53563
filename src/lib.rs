// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! FMTP — File Multicast Transport Protocol engine for LDM7/NOAAPort
//! product distribution.
//!
//! FMTP reliably delivers a stream of discrete "products" from one
//! sender to many subscribers: the bulk of each product's bytes travel
//! once over UDP multicast, and any bytes a subscriber misses are
//! recovered over a unicast TCP retransmission connection.
//!
//! # Module map
//!
//! | Module           | Responsibility                                             |
//! |-------------------|------------------------------------------------------------|
//! | [`wire`]          | 12-byte packet header and BOP payload framing              |
//! | [`product`]       | product index arithmetic, the signature map, the retx queue|
//! | [`rate`]          | outbound multicast pacing                                  |
//! | [`net`]           | client-address leasing and the authorization IPC channel   |
//! | [`future`]        | cancelable background threads                              |
//! | [`sender`]        | the FMTP sender: publisher + retransmission service        |
//! | [`receiver`]      | the FMTP receiver: reassembly + retransmission client       |
//! | [`control_plane`] | subscriber registry driving address leasing                |
//!
//! # Quick start (sender side)
//!
//! ```no_run
//! use std::net::{Ipv4Addr, SocketAddrV4};
//! use std::path::PathBuf;
//! use std::str::FromStr;
//! use std::sync::Arc;
//!
//! use fmtp::net::{AuthChannel, ClientAddressPool};
//! use fmtp::sender::{Sender, SenderConfig};
//!
//! # fn main() -> fmtp::error::Result<()> {
//! let pool = Arc::new(ClientAddressPool::new(ipnet::Ipv4Net::from_str("10.0.1.0/24").unwrap())?);
//! let auth = Arc::new(AuthChannel::create(0x0001)?);
//! let config = SenderConfig {
//!     feed_id: 0x0001,
//!     multicast_addr: SocketAddrV4::new(Ipv4Addr::new(224, 0, 1, 1), 38800),
//!     retx_listen_addr: "0.0.0.0:38801".parse().unwrap(),
//!     mtu: 1500,
//!     retx_window: 1000,
//!     rate_bps: 0,
//!     map_dir: PathBuf::from("/var/lib/fmtp"),
//!     max_sigs: 100_000,
//! };
//! let sender = Arc::new(Sender::new(config, pool, auth)?);
//! let (_acceptor, _auth_intake) = sender.spawn_services();
//! let index = sender.send(b"product bytes", vec![0x01, 0x02])?;
//! println!("published {index}");
//! # Ok(())
//! # }
//! ```

pub mod control_plane;
pub mod error;
pub mod future;
pub mod net;
pub mod product;
pub mod rate;
pub mod receiver;
pub mod sender;
pub mod wire;
