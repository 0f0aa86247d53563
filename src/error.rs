// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy shared across every FMTP component.

use std::fmt;
use std::io;

/// Error taxonomy for the FMTP engine and control plane.
///
/// Variants map directly onto the failure classes every component's
/// contract is specified against: malformed arguments (`Inval`), absent
/// entries (`NoEnt`), duplicate registration (`Dup`), busy resources
/// (`Busy`), cooperative cancellation (`Canceled`), retransmission-window
/// exhaustion (`Timeout`), on-disk corruption (`Corrupt`), and underlying
/// syscall failures (`System`).
#[derive(Debug)]
pub enum Error {
    /// Malformed argument: zero size, unparseable address, empty CIDR.
    Inval(String),
    /// Requested entry is absent (evicted product, unregistered feed).
    NoEnt,
    /// Attempted registration of a feed/subscriber already registered.
    Dup,
    /// Resource busy: future deletion while running, queue still in use.
    Busy,
    /// Operation was terminated by cancellation.
    Canceled,
    /// Retransmission window exceeded for an incomplete product.
    Timeout,
    /// Persistent store failed its schema/version check.
    Corrupt(String),
    /// Underlying syscall failure (I/O, socket, mutex poison).
    System(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Inval(msg) => write!(f, "invalid argument: {msg}"),
            Error::NoEnt => write!(f, "entry not found"),
            Error::Dup => write!(f, "already registered"),
            Error::Busy => write!(f, "resource busy"),
            Error::Canceled => write!(f, "operation canceled"),
            Error::Timeout => write!(f, "retransmission window exceeded"),
            Error::Corrupt(msg) => write!(f, "corrupt persistent store: {msg}"),
            Error::System(e) => write!(f, "system error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::System(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::System(e)
    }
}

/// Convenient alias for results using the crate's `Error` type.
pub type Result<T> = core::result::Result<T, Error>;
