// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Authorization Channel: a named, persistent, single-slot IPC queue
//! carrying authorized client IPv4 addresses from the Control Plane to
//! the Sender's authorization intake thread (spec.md §4.5).
//!
//! Built directly on POSIX message queues (`mq_open`/`mq_send`/
//! `mq_receive`/`mq_close`/`mq_unlink`) rather than a higher-level crate,
//! following the raw-libc-with-SAFETY-comments idiom the reference crate
//! uses for its POSIX shared memory segments
//! (`transport/shm/segment.rs`): a named kernel object, a creator that
//! owns unlink, and openers that only map/attach.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

const MSG_SIZE: usize = 4; // one IPv4 address, big-endian octets
const QUEUE_DEPTH: libc::c_long = 1; // single-slot, per spec.md §4.5

/// One end of a named authorization channel.
///
/// The reader (sender's authorization intake thread) creates the queue
/// and unlinks it when done; writers (the Control Plane) only open it.
pub struct AuthChannel {
    mqd: libc::mqd_t,
    name: CString,
    owns_unlink: bool,
}

// SAFETY: the underlying mqd_t is a kernel-managed descriptor; POSIX
// guarantees mq_send/mq_receive are safe to call concurrently from any
// thread holding the descriptor.
unsafe impl Send for AuthChannel {}

/// Matches spec.md §6's literal C `"/AuthMsgQ_feed_0x%X"` format exactly:
/// uppercase hex, unpadded. External tooling that greps for this queue
/// name depends on this casing.
fn queue_name(feed_id: u32) -> Result<CString> {
    CString::new(format!("/AuthMsgQ_feed_{feed_id:#X}"))
        .map_err(|_| Error::Inval("feed id produced an invalid queue name".into()))
}

impl AuthChannel {
    /// Create (or replace) the channel for `feed_id`. Only the Sender's
    /// authorization intake thread should call this.
    pub fn create(feed_id: u32) -> Result<Self> {
        let name = queue_name(feed_id)?;

        // SAFETY: name is a valid NUL-terminated CString; mq_unlink on a
        // nonexistent queue is harmless and its result is ignored.
        unsafe {
            libc::mq_unlink(name.as_ptr());
        }

        // SAFETY: mq_attr is a plain C struct of integer fields; zeroing
        // it and then setting the fields POSIX defines is equivalent to
        // a C `= {0}` initializer followed by field assignment.
        let mut attr: libc::mq_attr = unsafe { mem::zeroed() };
        attr.mq_maxmsg = QUEUE_DEPTH;
        attr.mq_msgsize = MSG_SIZE as libc::c_long;

        // SAFETY: name is valid, attr is a fully initialized mq_attr, and
        // O_CREAT|O_EXCL|O_RDWR is a valid flag combination for mq_open;
        // the fd-equivalent mqd_t is checked for the sentinel error value
        // below before being trusted.
        let mqd = unsafe {
            libc::mq_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
                &attr as *const libc::mq_attr,
            )
        };

        if mqd == -1 {
            return Err(Error::System(io::Error::last_os_error()));
        }

        Ok(Self {
            mqd,
            name,
            owns_unlink: true,
        })
    }

    /// Open an existing channel for `feed_id` as a writer.
    pub fn open_existing(feed_id: u32) -> Result<Self> {
        let name = queue_name(feed_id)?;

        // SAFETY: name is valid; O_RDWR is a valid flag for opening an
        // existing queue (attr argument is ignored by POSIX in this mode).
        let mqd = unsafe { libc::mq_open(name.as_ptr(), libc::O_RDWR) };

        if mqd == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(Error::NoEnt);
            }
            return Err(Error::System(err));
        }

        Ok(Self {
            mqd,
            name,
            owns_unlink: false,
        })
    }

    /// Send an authorized address. Per spec.md §4.5, this is
    /// non-blocking when the single slot is empty and blocks until the
    /// prior entry is consumed otherwise — i.e. a plain `mq_send`, since
    /// the queue was opened in blocking mode.
    pub fn send(&self, addr: Ipv4Addr) -> Result<()> {
        let bytes = addr.octets();

        // SAFETY: self.mqd is a valid, open descriptor; bytes has exactly
        // MSG_SIZE length matching the queue's configured mq_msgsize.
        let ret = unsafe {
            libc::mq_send(
                self.mqd,
                bytes.as_ptr() as *const libc::c_char,
                MSG_SIZE,
                0,
            )
        };

        if ret == -1 {
            return Err(Error::System(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Block until an authorized address arrives.
    pub fn receive(&self) -> Result<Ipv4Addr> {
        let mut buf = [0u8; MSG_SIZE];
        let mut priority: libc::c_uint = 0;

        // SAFETY: self.mqd is valid and open for reading; buf is sized
        // exactly MSG_SIZE, matching the queue's mq_msgsize, so the
        // kernel will never write past it.
        let n = unsafe {
            libc::mq_receive(
                self.mqd,
                buf.as_mut_ptr() as *mut libc::c_char,
                MSG_SIZE,
                &mut priority as *mut libc::c_uint,
            )
        };

        if n == -1 {
            return Err(Error::System(io::Error::last_os_error()));
        }
        if n as usize != MSG_SIZE {
            return Err(Error::Corrupt(format!(
                "authorization message had unexpected length {n}"
            )));
        }
        Ok(Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]))
    }
}

impl Drop for AuthChannel {
    fn drop(&mut self) {
        // SAFETY: self.mqd is a valid descriptor owned by this struct and
        // not shared; closing it here is the sole close for this handle.
        unsafe {
            libc::mq_close(self.mqd);
        }
        if self.owns_unlink {
            // SAFETY: self.name is a valid NUL-terminated CString; unlink
            // of an already-removed name is a harmless no-op error.
            unsafe {
                libc::mq_unlink(self.name.as_ptr());
            }
        }
    }
}
