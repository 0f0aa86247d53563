// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persistent product-index → signature map (spec.md §4.2, §6).
//!
//! On-disk layout (fixed header followed by a flat array of cells):
//!
//! ```text
//! Header (18 bytes):
//!   magic        u32   "FMPI" (0x464D_5049)
//!   version      u16   1
//!   max_sigs     u32   ring capacity
//!   count        u32   number of valid entries (0..=max_sigs)
//!   oldest_index u32   meaningful only when count > 0
//!
//! Cells (20 bytes each, max_sigs of them):
//!   owner_index  u32   which product index currently occupies this slot
//!   signature    [u8; 16]
//! ```
//!
//! A cell's physical slot is `index mod max_sigs`; `owner_index` lets
//! `get` distinguish "this slot holds a stale/cleared entry" from "this
//! slot holds the signature for the index I asked about", which is what
//! makes `put`'s span-clearing (spec.md §4.2) cheap: clearing a span is
//! simply *not writing it* — `get` on an uncleared slot whose owner
//! doesn't match returns `NoEnt`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::product::{ProductIndex, Signature};

const MAGIC: u32 = 0x464D_5049;
const VERSION: u16 = 1;
const HEADER_LEN: u64 = 4 + 2 + 4 + 4 + 4;
const CELL_LEN: u64 = 4 + 16;

/// Persistent, write-through ring map from product index to signature.
pub struct ProductIndexMap {
    file: File,
    path: PathBuf,
    max_sigs: u32,
    count: u32,
    oldest: ProductIndex,
    writable: bool,
}

impl ProductIndexMap {
    /// Compute the on-disk file path for a feed-type map.
    pub fn path_for(dir: &Path, feed: u32) -> PathBuf {
        dir.join(format!("fmtp_prodindex_feed_{feed:#010x}.dat"))
    }

    /// Open (creating if absent) a map for writing, with the given ring
    /// capacity. If a map already exists with a different `max_sigs`, it
    /// is rebuilt in place, truncating from the oldest end if the new
    /// capacity is smaller (spec.md §4.2).
    pub fn open_for_writing(dir: &Path, feed: u32, max_sigs: u32) -> Result<Self> {
        if max_sigs == 0 {
            return Err(Error::Inval("maxSigs must be > 0".into()));
        }
        let path = Self::path_for(dir, feed);
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if !existed || file.metadata()?.len() < HEADER_LEN {
            return Self::init_empty(file, path, max_sigs, true);
        }

        let (stored_max_sigs, count, oldest) = Self::read_header(&mut file)?;
        if stored_max_sigs == max_sigs {
            return Ok(Self {
                file,
                path,
                max_sigs,
                count,
                oldest,
                writable: true,
            });
        }

        // Capacity changed: rebuild with the retained window re-addressed
        // against the new capacity, truncating the oldest entries first.
        let retained = count.min(max_sigs);
        let new_oldest = ProductIndex(oldest.0.wrapping_add(count - retained));
        let mut entries = Vec::with_capacity(retained as usize);
        for i in 0..retained {
            let idx = ProductIndex(new_oldest.0.wrapping_add(i));
            if let Some(sig) = Self::read_cell(&mut file, stored_max_sigs, idx)? {
                entries.push((idx, sig));
            }
        }

        let mut rebuilt = Self::init_empty(file, path.clone(), max_sigs, true)?;
        for (idx, sig) in entries {
            rebuilt.put(idx, sig)?;
        }
        Ok(rebuilt)
    }

    /// Open an existing map for reading only.
    pub fn open_for_reading(dir: &Path, feed: u32) -> Result<Self> {
        let path = Self::path_for(dir, feed);
        let mut file = OpenOptions::new().read(true).open(&path)?;
        let (max_sigs, count, oldest) = Self::read_header(&mut file)?;
        Ok(Self {
            file,
            path,
            max_sigs,
            count,
            oldest,
            writable: false,
        })
    }

    /// Remove the on-disk map file for a feed.
    pub fn delete(dir: &Path, feed: u32) -> Result<()> {
        let path = Self::path_for(dir, feed);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn init_empty(mut file: File, path: PathBuf, max_sigs: u32, writable: bool) -> Result<Self> {
        file.set_len(HEADER_LEN + CELL_LEN * max_sigs as u64)?;
        let mut map = Self {
            file,
            path,
            max_sigs,
            count: 0,
            oldest: ProductIndex::ZERO,
            writable,
        };
        map.write_header()?;
        Ok(map)
    }

    fn newest(&self) -> Option<ProductIndex> {
        if self.count == 0 {
            None
        } else {
            Some(ProductIndex(
                self.oldest.0.wrapping_add(self.count - 1),
            ))
        }
    }

    /// The next product index to assign, i.e. `newestIndex + 1`, or zero
    /// for a freshly created (empty) map.
    pub fn next_prod_index(&self) -> ProductIndex {
        match self.newest() {
            Some(n) => n.next(),
            None => ProductIndex::ZERO,
        }
    }

    fn in_window(&self, index: ProductIndex) -> bool {
        match self.newest() {
            None => false,
            Some(newest) => {
                !index.precedes(self.oldest) && (index == self.oldest || index.precedes(newest) || index == newest)
            }
        }
    }

    /// Insert or update `(index, signature)`. See module docs and
    /// spec.md §4.2 for the append/clear/overwrite/reject rules.
    pub fn put(&mut self, index: ProductIndex, signature: Signature) -> Result<()> {
        if !self.writable {
            return Err(Error::Inval("map opened for reading".into()));
        }

        if self.count == 0 {
            self.oldest = index;
            self.count = 1;
        } else {
            let newest = self.newest().unwrap();
            if index == newest.next() {
                if self.count == self.max_sigs {
                    self.oldest = self.oldest.next();
                } else {
                    self.count += 1;
                }
            } else if self.in_window(index) {
                // overwrite in place, no window change
            } else if newest.precedes(index) {
                let gap = newest.distance_to(index);
                if gap as u64 >= self.max_sigs as u64 {
                    self.oldest = index;
                    self.count = 1;
                } else {
                    let new_count = (self.count as u64 + gap as u64).min(self.max_sigs as u64) as u32;
                    self.oldest = ProductIndex(index.0.wrapping_sub(new_count - 1));
                    self.count = new_count;
                }
            } else {
                return Err(Error::NoEnt);
            }
        }

        self.write_cell(index, &signature)?;
        self.write_header()?;
        Ok(())
    }

    /// Look up the signature for `index`, or `Err(NoEnt)` if it is absent
    /// or has been evicted/cleared.
    pub fn get(&mut self, index: ProductIndex) -> Result<Signature> {
        if !self.in_window(index) {
            return Err(Error::NoEnt);
        }
        match Self::read_cell(&mut self.file, self.max_sigs, index)? {
            Some(sig) => Ok(sig),
            None => Err(Error::NoEnt),
        }
    }

    /// Flush and fsync the map to disk.
    pub fn close(mut self) -> Result<()> {
        if self.writable {
            self.write_header()?;
            self.file.sync_all()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(&mut self) -> Result<()> {
        let mut buf = Vec::with_capacity(HEADER_LEN as usize);
        buf.extend_from_slice(&MAGIC.to_be_bytes());
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.extend_from_slice(&self.max_sigs.to_be_bytes());
        buf.extend_from_slice(&self.count.to_be_bytes());
        buf.extend_from_slice(&self.oldest.0.to_be_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        self.file.flush()?;
        Ok(())
    }

    fn read_header(file: &mut File) -> Result<(u32, u32, ProductIndex)> {
        let mut buf = [0u8; HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::Corrupt(format!("bad magic: {magic:#010x}")));
        }
        let version = u16::from_be_bytes(buf[4..6].try_into().unwrap());
        if version != VERSION {
            return Err(Error::Corrupt(format!("unsupported version: {version}")));
        }
        let max_sigs = u32::from_be_bytes(buf[6..10].try_into().unwrap());
        let count = u32::from_be_bytes(buf[10..14].try_into().unwrap());
        let oldest = ProductIndex(u32::from_be_bytes(buf[14..18].try_into().unwrap()));
        Ok((max_sigs, count, oldest))
    }

    fn cell_offset(max_sigs: u32, index: ProductIndex) -> u64 {
        HEADER_LEN + (index.0 as u64 % max_sigs as u64) * CELL_LEN
    }

    fn write_cell(&mut self, index: ProductIndex, sig: &Signature) -> Result<()> {
        let offset = Self::cell_offset(self.max_sigs, index);
        let mut buf = Vec::with_capacity(CELL_LEN as usize);
        buf.extend_from_slice(&index.0.to_be_bytes());
        buf.extend_from_slice(sig.as_bytes());
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    fn read_cell(file: &mut File, max_sigs: u32, index: ProductIndex) -> Result<Option<Signature>> {
        let offset = Self::cell_offset(max_sigs, index);
        let mut buf = [0u8; CELL_LEN as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        let owner = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if owner != index.0 {
            return Ok(None);
        }
        let mut sig = [0u8; 16];
        sig.copy_from_slice(&buf[4..20]);
        Ok(Some(Signature(sig)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sig(n: u8) -> Signature {
        Signature([n; 16])
    }

    #[test]
    fn put_then_get_within_window() {
        let dir = tempdir().unwrap();
        let mut map = ProductIndexMap::open_for_writing(dir.path(), 1, 4).unwrap();
        map.put(ProductIndex(0), sig(1)).unwrap();
        map.put(ProductIndex(1), sig(2)).unwrap();
        assert_eq!(map.get(ProductIndex(0)).unwrap(), sig(1));
        assert_eq!(map.get(ProductIndex(1)).unwrap(), sig(2));
    }

    #[test]
    fn eviction_when_capacity_exceeded() {
        let dir = tempdir().unwrap();
        let mut map = ProductIndexMap::open_for_writing(dir.path(), 1, 2).unwrap();
        map.put(ProductIndex(0), sig(1)).unwrap();
        map.put(ProductIndex(1), sig(2)).unwrap();
        map.put(ProductIndex(2), sig(3)).unwrap(); // evicts 0
        assert!(matches!(map.get(ProductIndex(0)), Err(Error::NoEnt)));
        assert_eq!(map.get(ProductIndex(1)).unwrap(), sig(2));
        assert_eq!(map.get(ProductIndex(2)).unwrap(), sig(3));
    }

    #[test]
    fn jump_ahead_clears_intervening_span() {
        let dir = tempdir().unwrap();
        let mut map = ProductIndexMap::open_for_writing(dir.path(), 1, 8).unwrap();
        map.put(ProductIndex(0), sig(1)).unwrap();
        map.put(ProductIndex(5), sig(2)).unwrap(); // clears [1,5)
        assert!(matches!(map.get(ProductIndex(0)), Err(Error::NoEnt)));
        for i in 1..5 {
            assert!(matches!(map.get(ProductIndex(i)), Err(Error::NoEnt)));
        }
        assert_eq!(map.get(ProductIndex(5)).unwrap(), sig(2));
    }

    #[test]
    fn overwrite_in_window() {
        let dir = tempdir().unwrap();
        let mut map = ProductIndexMap::open_for_writing(dir.path(), 1, 4).unwrap();
        map.put(ProductIndex(0), sig(1)).unwrap();
        map.put(ProductIndex(1), sig(2)).unwrap();
        map.put(ProductIndex(0), sig(9)).unwrap(); // overwrite, in window
        assert_eq!(map.get(ProductIndex(0)).unwrap(), sig(9));
    }

    #[test]
    fn out_of_window_put_is_rejected() {
        let dir = tempdir().unwrap();
        let mut map = ProductIndexMap::open_for_writing(dir.path(), 1, 4).unwrap();
        map.put(ProductIndex(10), sig(1)).unwrap();
        map.put(ProductIndex(11), sig(2)).unwrap();
        map.put(ProductIndex(12), sig(3)).unwrap();
        map.put(ProductIndex(13), sig(4)).unwrap();
        // window is now [10,13]; putting 5 is older-but-out-of-window
        assert!(matches!(
            map.put(ProductIndex(5), sig(5)),
            Err(Error::NoEnt)
        ));
    }

    #[test]
    fn persists_across_close_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut map = ProductIndexMap::open_for_writing(dir.path(), 7, 4).unwrap();
            map.put(ProductIndex(0xFFFF_FFFE), sig(1)).unwrap();
            map.put(ProductIndex(0xFFFF_FFFF), sig(2)).unwrap();
            map.put(ProductIndex(0x0000_0000), sig(3)).unwrap();
            map.close().unwrap();
        }
        let mut map = ProductIndexMap::open_for_reading(dir.path(), 7).unwrap();
        assert_eq!(map.get(ProductIndex(0xFFFF_FFFF)).unwrap(), sig(2));
        assert_eq!(
            map.next_prod_index(),
            ProductIndex(0x0000_0000).next()
        );
    }

    #[test]
    fn zero_max_sigs_is_invalid() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            ProductIndexMap::open_for_writing(dir.path(), 1, 0),
            Err(Error::Inval(_))
        ));
    }

    #[test]
    fn shrinking_capacity_on_reopen_truncates_oldest() {
        let dir = tempdir().unwrap();
        {
            let mut map = ProductIndexMap::open_for_writing(dir.path(), 2, 4).unwrap();
            for i in 0..4u32 {
                map.put(ProductIndex(i), sig(i as u8)).unwrap();
            }
            map.close().unwrap();
        }
        let mut map = ProductIndexMap::open_for_writing(dir.path(), 2, 2).unwrap();
        assert!(matches!(map.get(ProductIndex(0)), Err(Error::NoEnt)));
        assert!(matches!(map.get(ProductIndex(1)), Err(Error::NoEnt)));
        assert_eq!(map.get(ProductIndex(2)).unwrap(), sig(2));
        assert_eq!(map.get(ProductIndex(3)).unwrap(), sig(3));
    }

    #[test]
    fn reading_nonexistent_map_fails() {
        let dir = tempdir().unwrap();
        assert!(ProductIndexMap::open_for_reading(dir.path(), 99).is_err());
    }
}
