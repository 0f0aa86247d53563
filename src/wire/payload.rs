// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! BOP payload framing (spec.md §3): `prodSize(u32) || metaSize(u16) || metadata`.
//!
//! EOP and data payloads carry no additional framing beyond the header
//! (EOP is empty; data is the raw product bytes at `seqNum`), so only BOP
//! needs its own codec here.

use crate::error::{Error, Result};

/// BOP payload: total product size, metadata length, and metadata bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BopPayload {
    pub prod_size: u32,
    pub metadata: Vec<u8>,
}

impl BopPayload {
    pub fn new(prod_size: u32, metadata: Vec<u8>) -> Result<Self> {
        if metadata.len() > u16::MAX as usize {
            return Err(Error::Inval(format!(
                "metadata length {} exceeds u16 cap",
                metadata.len()
            )));
        }
        Ok(Self {
            prod_size,
            metadata,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6 + self.metadata.len());
        buf.extend_from_slice(&self.prod_size.to_be_bytes());
        buf.extend_from_slice(&(self.metadata.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.metadata);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 6 {
            return Err(Error::Inval(format!(
                "BOP payload truncated: {} bytes, need at least 6",
                buf.len()
            )));
        }
        let prod_size = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let meta_size = u16::from_be_bytes(buf[4..6].try_into().unwrap()) as usize;
        let rest = &buf[6..];
        if rest.len() < meta_size {
            return Err(Error::Inval(format!(
                "BOP payload metadata truncated: {} bytes, need {meta_size}",
                rest.len()
            )));
        }
        Ok(Self {
            prod_size,
            metadata: rest[..meta_size].to_vec(),
        })
    }
}

// `RETX_REQ`'s requested byte range (spec.md §4.7) needs no payload
// struct: the 12-byte header alone carries it, with `seqNum` reused as
// the gap start and `payloadLen` as the requested length `L`. See
// `sender::serve_request` / `receiver::service_one_request`.
