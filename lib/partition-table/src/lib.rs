// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash partition table.
//!
//! The default table is generated at build time from `board.toml` (see
//! `build.rs`). A factory-programmed table in the factory NV store takes
//! precedence when present and sane.

#![cfg_attr(not(test), no_std)]

use drv_flash_api::{Flash, SECTOR_SIZE};
use nv_store::{id, NvError, NvStore};
use ringbuf::{ringbuf, ringbuf_entry};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

include!(concat!(env!("OUT_DIR"), "/board.rs"));

pub const PARTITION_COUNT: usize = 7;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Partition {
    Boot = 0,
    FactoryNv,
    NormalNv,
    NormalNvBackup,
    KernelA,
    KernelB,
    /// Factory test image.
    Factory,
}

impl Partition {
    pub const ALL: [Partition; PARTITION_COUNT] = [
        Partition::Boot,
        Partition::FactoryNv,
        Partition::NormalNv,
        Partition::NormalNvBackup,
        Partition::KernelA,
        Partition::KernelB,
        Partition::Factory,
    ];

    /// The other kernel bank. Non-kernel partitions have no alternate and
    /// map to themselves.
    pub fn alternate(self) -> Partition {
        match self {
            Partition::KernelA => Partition::KernelB,
            Partition::KernelB => Partition::KernelA,
            other => other,
        }
    }

    pub fn is_kernel(self) -> bool {
        matches!(self, Partition::KernelA | Partition::KernelB)
    }
}

#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct Region {
    pub base: u32,
    pub size: u32,
}

impl Region {
    pub fn end(&self) -> u32 {
        self.base + self.size
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// True if `[addr, addr + len)` lies entirely inside this region.
    pub fn contains_range(&self, addr: u32, len: u32) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.base && end <= self.end(),
            None => false,
        }
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TableError {
    /// A region is empty, unaligned, runs off the end of flash, or overlaps
    /// another one.
    Invalid,
    Nv(NvError),
}

impl From<NvError> for TableError {
    fn from(e: NvError) -> Self {
        TableError::Nv(e)
    }
}

/// The table as stored in factory NV: one region per [`Partition`], in
/// declaration order.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct PartitionTable {
    pub regions: [Region; PARTITION_COUNT],
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Loaded,
    UsingDefault(TableError),
}

ringbuf!(Trace, 4, Trace::None);

impl PartitionTable {
    pub fn get(&self, p: Partition) -> Region {
        self.regions[p as usize]
    }

    /// Which kernel bank, if any, contains `addr`.
    pub fn kernel_of(&self, addr: u32) -> Option<Partition> {
        Partition::ALL
            .into_iter()
            .find(|&p| p.is_kernel() && self.get(p).contains(addr))
    }

    pub fn is_kernel_base(&self, addr: u32) -> bool {
        addr == self.get(Partition::KernelA).base
            || addr == self.get(Partition::KernelB).base
    }

    /// Checks the same rules the build script applies to the board file.
    pub fn validate(&self, flash_size: u32) -> Result<(), TableError> {
        for (i, r) in self.regions.iter().enumerate() {
            let in_flash = r
                .base
                .checked_add(r.size)
                .is_some_and(|end| end <= flash_size);
            if r.size == 0
                || r.base % SECTOR_SIZE != 0
                || r.size % SECTOR_SIZE != 0
                || !in_flash
            {
                return Err(TableError::Invalid);
            }
            if self.regions[i + 1..].iter().any(|o| o.overlaps(r)) {
                return Err(TableError::Invalid);
            }
        }
        Ok(())
    }

    /// Reads the factory-programmed table.
    ///
    /// On failure the compiled default is returned alongside the error, so
    /// that the caller can report it and carry on booting.
    pub fn load(
        flash: &mut impl Flash,
        nv: &NvStore,
    ) -> (PartitionTable, Result<(), TableError>) {
        let stored = nv
            .read_record::<PartitionTable>(flash, id::PARTITION_TABLE)
            .map_err(TableError::from)
            .and_then(|t| t.validate(flash.geometry().size).map(|()| t));
        match stored {
            Ok(t) => {
                ringbuf_entry!(Trace::Loaded);
                (t, Ok(()))
            }
            Err(e) => {
                ringbuf_entry!(Trace::UsingDefault(e));
                (DEFAULT_TABLE, Err(e))
            }
        }
    }
}
