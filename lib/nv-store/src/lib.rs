// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key/record store for small fixed-format records in flash.
//!
//! The region handed to [`NvStore::mount`] is split into two equal banks.
//! Each bank is an array of [`SLOT_SIZE`]-byte slots, and each slot holds
//! one [`RawSlot`]: a small header, up to [`MAX_RECORD_LEN`] bytes of
//! record data, and a CRC-32 over everything before it.
//!
//! Records are never rewritten in place. A write programs the next erased
//! slot of the active bank with a sequence number one greater than any seen
//! so far, and a read returns the valid copy of the id with the highest
//! sequence number across both banks. A slot is programmed with a single
//! page write, so a power loss leaves either a complete record or a slot
//! that fails its checksum and is ignored.
//!
//! When the active bank fills up the newest copy of every id is moved to
//! the other bank, which then becomes active, and the old bank is erased.
//! Banks therefore take turns being erased. At every point of that process
//! the newest valid copy of each id is still present somewhere, with its
//! original sequence number.

#![cfg_attr(not(test), no_std)]

use core::mem::size_of;
use drv_flash_api::{Flash, FlashError, SECTOR_SIZE};
use ringbuf::{ringbuf, ringbuf_entry};
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

pub const SLOT_SIZE: usize = 256;
pub const MAX_RECORD_LEN: usize = 240;
pub const SLOT_MAGIC: u32 = 0x4e56_5243;
pub const SLOT_HEADER_VERSION: u8 = 1;

/// Record ids used in the factory NV store.
pub mod id {
    pub const PARTITION_TABLE: u8 = 0x2;
    pub const STARTUP_CFG: u8 = 0x3;
    pub const KERNEL_A_KEY: u8 = 0x4;
    pub const KERNEL_A_KEY_BACKUP: u8 = 0x5;
    pub const KERNEL_B_KEY: u8 = 0x6;
    pub const KERNEL_B_KEY_BACKUP: u8 = 0x7;
    pub const CRYPT_COUNT: u8 = 0x8;
    pub const FACTORY_MODE: u8 = 0x9;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NvError {
    /// No valid record with this id exists.
    NotFound,
    /// The record is larger than a slot, or does not match the length the
    /// caller asked for.
    BadLength,
    /// The region handed to `mount` cannot be split into two banks.
    BadRegion,
    /// Every slot is taken by the newest copy of some id.
    Full,
    Flash(FlashError),
}

impl From<FlashError> for NvError {
    fn from(e: FlashError) -> Self {
        NvError::Flash(e)
    }
}

/// On-flash layout of one slot.
#[derive(
    Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct RawSlot {
    /// Must always be `SLOT_MAGIC`.
    magic: u32,

    /// Must always be `SLOT_HEADER_VERSION` (for now)
    header_version: u8,

    pub id: u8,
    pub len: u16,

    /// Monotonically increasing across the whole store
    pub sequence: u32,

    data: [u8; MAX_RECORD_LEN],

    /// CRC-32 over the rest of the slot using the iSCSI polynomial
    checksum: u32,
}

const_assert_eq!(size_of::<RawSlot>(), SLOT_SIZE);

impl RawSlot {
    pub fn new(id: u8, sequence: u32, record: &[u8]) -> Result<Self, NvError> {
        if record.len() > MAX_RECORD_LEN {
            return Err(NvError::BadLength);
        }
        let mut data = [0xff; MAX_RECORD_LEN];
        data[..record.len()].copy_from_slice(record);
        let mut out = Self {
            magic: SLOT_MAGIC,
            header_version: SLOT_HEADER_VERSION,
            id,
            len: record.len() as u16,
            sequence,
            data,
            checksum: 0,
        };
        out.checksum = out.expected_checksum();
        Ok(out)
    }

    fn expected_checksum(&self) -> u32 {
        static CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);
        let mut c = CRC.digest();
        // The checksum is the trailing u32; cover everything before it.
        c.update(&self.as_bytes()[..SLOT_SIZE - size_of::<u32>()]);
        c.finalize()
    }

    pub fn is_valid(&self) -> bool {
        self.magic == SLOT_MAGIC
            && self.header_version == SLOT_HEADER_VERSION
            && usize::from(self.len) <= MAX_RECORD_LEN
            && self.checksum == self.expected_checksum()
    }

    pub fn is_erased(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0xff)
    }

    pub fn record(&self) -> &[u8] {
        &self.data[..usize::from(self.len).min(MAX_RECORD_LEN)]
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Mounted { active: u8, next_slot: u32, sequence: u32 },
    Write { id: u8, sequence: u32, slot: u32 },
    WriteFailed { id: u8, err: FlashError },
    Compact { from: u8, to: u8, kept: u32 },
    EraseAll,
}

ringbuf!(Trace, 16, Trace::None);

/// Handle on a mounted store. The store does not own the flash; every call
/// borrows it, so several stores (and other users) can share one part.
#[derive(Debug)]
pub struct NvStore {
    base: u32,
    bank_size: u32,
    active: u8,
    next_slot: u32,
    sequence: u32,
}

impl NvStore {
    /// Scans `[base, base + size)` and works out the active bank, the next
    /// free slot, and the highest sequence number in use.
    pub fn mount(
        flash: &mut impl Flash,
        base: u32,
        size: u32,
    ) -> Result<Self, NvError> {
        let bank_size = size / 2;
        if bank_size == 0
            || bank_size % SECTOR_SIZE != 0
            || base % SECTOR_SIZE != 0
        {
            return Err(NvError::BadRegion);
        }
        flash.geometry().offset_of(base, size as usize)?;

        let mut store = Self {
            base,
            bank_size,
            active: 0,
            next_slot: 0,
            sequence: 0,
        };

        // Newest sequence number per id across both banks, and which banks
        // hold that newest copy.
        let mut newest = [0u32; 256];
        let mut holders = [0u8; 256];
        let mut used = [0u32; 2];
        for pass in 0..2 {
            for bank in 0..2u8 {
                for slot in 0..store.slots_per_bank() {
                    let raw = store.read_slot(flash, bank, slot)?;
                    if pass == 0 && !raw.is_erased() {
                        used[usize::from(bank)] = slot + 1;
                    }
                    if !raw.is_valid() {
                        continue;
                    }
                    let id = usize::from(raw.id);
                    if pass == 0 {
                        newest[id] = newest[id].max(raw.sequence);
                    } else if raw.sequence == newest[id] {
                        holders[id] |= 1 << bank;
                    }
                }
            }
        }

        // Normally only one bank holds records. Both do only if a
        // compaction was interrupted, and then the bank to keep appending
        // to is one holding the newest copy of every id: the source if the
        // copy was cut short, or the (emptier) destination if the erase of
        // the source was.
        let covers = |bank: u8| {
            holders
                .iter()
                .zip(&newest)
                .all(|(&h, &n)| n == 0 || h & (1 << bank) != 0)
        };
        store.active = match (covers(0), covers(1)) {
            (true, true) if used[1] < used[0] => 1,
            (false, true) => 1,
            _ => 0,
        };
        store.sequence = newest.iter().copied().max().unwrap_or(0);
        store.next_slot = used[usize::from(store.active)];

        ringbuf_entry!(Trace::Mounted {
            active: store.active,
            next_slot: store.next_slot,
            sequence: store.sequence,
        });
        Ok(store)
    }

    pub fn slots_per_bank(&self) -> u32 {
        self.bank_size / SLOT_SIZE as u32
    }

    pub fn active_bank(&self) -> u8 {
        self.active
    }

    fn slot_addr(&self, bank: u8, slot: u32) -> u32 {
        self.base + u32::from(bank) * self.bank_size + slot * SLOT_SIZE as u32
    }

    fn read_slot(
        &self,
        flash: &mut impl Flash,
        bank: u8,
        slot: u32,
    ) -> Result<RawSlot, NvError> {
        let mut raw = RawSlot::new_zeroed();
        flash.read(self.slot_addr(bank, slot), raw.as_mut_bytes())?;
        Ok(raw)
    }

    /// Finds the newest valid copy of `id` in either bank.
    fn find(
        &self,
        flash: &mut impl Flash,
        id: u8,
    ) -> Result<Option<RawSlot>, NvError> {
        let mut best: Option<RawSlot> = None;
        for bank in 0..2u8 {
            for slot in 0..self.slots_per_bank() {
                let raw = self.read_slot(flash, bank, slot)?;
                if raw.is_valid()
                    && raw.id == id
                    && best.map_or(true, |b| raw.sequence > b.sequence)
                {
                    best = Some(raw);
                }
            }
        }
        Ok(best)
    }

    /// Copies the newest record for `id` into `buf` and returns its length.
    pub fn read(
        &self,
        flash: &mut impl Flash,
        id: u8,
        buf: &mut [u8],
    ) -> Result<usize, NvError> {
        let raw = self.find(flash, id)?.ok_or(NvError::NotFound)?;
        let record = raw.record();
        let out = buf.get_mut(..record.len()).ok_or(NvError::BadLength)?;
        out.copy_from_slice(record);
        Ok(record.len())
    }

    /// Stores `record` as the newest copy of `id`.
    pub fn write(
        &mut self,
        flash: &mut impl Flash,
        id: u8,
        record: &[u8],
    ) -> Result<(), NvError> {
        if record.len() > MAX_RECORD_LEN {
            return Err(NvError::BadLength);
        }
        if self.next_slot >= self.slots_per_bank() {
            self.compact(flash)?;
        }

        let sequence = self.sequence.wrapping_add(1);
        let raw = RawSlot::new(id, sequence, record)?;
        let slot = self.next_slot;
        let addr = self.slot_addr(self.active, slot);

        // Whatever happens, this slot is no longer clean.
        self.next_slot += 1;
        if let Err(err) = flash.write(addr, raw.as_bytes()) {
            ringbuf_entry!(Trace::WriteFailed { id, err });
            return Err(err.into());
        }
        self.sequence = sequence;
        ringbuf_entry!(Trace::Write { id, sequence, slot });
        Ok(())
    }

    /// Moves the newest copy of every id into the inactive bank, makes it
    /// active, and erases the old bank.
    fn compact(&mut self, flash: &mut impl Flash) -> Result<(), NvError> {
        let from = self.active;
        let to = 1 - from;
        flash.erase(self.slot_addr(to, 0), self.bank_size)?;

        let mut kept = 0;
        for slot in 0..self.slots_per_bank() {
            let raw = self.read_slot(flash, from, slot)?;
            if !raw.is_valid() {
                continue;
            }
            let newest = self.find(flash, raw.id)?;
            if newest.map(|n| n.sequence) != Some(raw.sequence) {
                continue;
            }
            // Leave room for the write that triggered us.
            if kept + 1 >= self.slots_per_bank() {
                return Err(NvError::Full);
            }
            flash.write(self.slot_addr(to, kept), raw.as_bytes())?;
            kept += 1;
        }

        flash.erase(self.slot_addr(from, 0), self.bank_size)?;
        ringbuf_entry!(Trace::Compact { from, to, kept });
        self.active = to;
        self.next_slot = kept;
        Ok(())
    }

    /// Erases both banks, dropping every record.
    pub fn erase_all(&mut self, flash: &mut impl Flash) -> Result<(), NvError> {
        ringbuf_entry!(Trace::EraseAll);
        flash.erase(self.base, self.bank_size * 2)?;
        self.active = 0;
        self.next_slot = 0;
        Ok(())
    }

    /// Reads a record that is stored as the raw bytes of `T`.
    pub fn read_record<T>(
        &self,
        flash: &mut impl Flash,
        id: u8,
    ) -> Result<T, NvError>
    where
        T: FromBytes + IntoBytes + KnownLayout + Immutable,
    {
        let mut out = T::new_zeroed();
        let n = self.read(flash, id, out.as_mut_bytes())?;
        if n != size_of::<T>() {
            return Err(NvError::BadLength);
        }
        Ok(out)
    }

    pub fn write_record<T>(
        &mut self,
        flash: &mut impl Flash,
        id: u8,
        record: &T,
    ) -> Result<(), NvError>
    where
        T: IntoBytes + Immutable,
    {
        self.write(flash, id, record.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_flash_api::RamFlash;

    const BASE: u32 = 0x8000;
    const SIZE: u32 = 0x2000;

    fn backing() -> Vec<u8> {
        vec![0xff; (BASE + SIZE) as usize]
    }

    #[test]
    fn empty_store_reads_not_found() {
        let mut mem = backing();
        let mut flash = RamFlash::new(0, &mut mem);
        let nv = NvStore::mount(&mut flash, BASE, SIZE).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(nv.read(&mut flash, 3, &mut buf), Err(NvError::NotFound));
    }

    #[test]
    fn newest_copy_wins_and_survives_remount() {
        let mut mem = backing();
        let mut flash = RamFlash::new(0, &mut mem);
        let mut nv = NvStore::mount(&mut flash, BASE, SIZE).unwrap();
        nv.write(&mut flash, 3, b"first").unwrap();
        nv.write(&mut flash, 9, b"other").unwrap();
        nv.write(&mut flash, 3, b"second").unwrap();

        let nv = NvStore::mount(&mut flash, BASE, SIZE).unwrap();
        let mut buf = [0u8; 16];
        let n = nv.read(&mut flash, 3, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"second");
        let n = nv.read(&mut flash, 9, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"other");
    }

    #[test]
    fn oversized_record_is_refused() {
        let mut mem = backing();
        let mut flash = RamFlash::new(0, &mut mem);
        let mut nv = NvStore::mount(&mut flash, BASE, SIZE).unwrap();
        let big = [0u8; MAX_RECORD_LEN + 1];
        assert_eq!(nv.write(&mut flash, 1, &big), Err(NvError::BadLength));
        nv.write(&mut flash, 1, &big[..MAX_RECORD_LEN]).unwrap();
    }

    #[test]
    fn short_buffer_is_bad_length() {
        let mut mem = backing();
        let mut flash = RamFlash::new(0, &mut mem);
        let mut nv = NvStore::mount(&mut flash, BASE, SIZE).unwrap();
        nv.write(&mut flash, 1, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(nv.read(&mut flash, 1, &mut buf), Err(NvError::BadLength));
    }

    #[test]
    fn bad_region() {
        let mut mem = backing();
        let mut flash = RamFlash::new(0, &mut mem);
        assert_eq!(
            NvStore::mount(&mut flash, BASE, 0x1000).unwrap_err(),
            NvError::BadRegion
        );
        assert_eq!(
            NvStore::mount(&mut flash, BASE + 0x100, SIZE).unwrap_err(),
            NvError::BadRegion
        );
    }

    #[test]
    fn torn_write_keeps_previous_value() {
        let mut mem = backing();
        let mut flash = RamFlash::new(0, &mut mem);
        let mut nv = NvStore::mount(&mut flash, BASE, SIZE).unwrap();
        nv.write(&mut flash, 3, b"good").unwrap();

        flash.fail_after_writes(0);
        assert!(nv.write(&mut flash, 3, b"torn").is_err());
        flash.clear_fault();

        let mut nv = NvStore::mount(&mut flash, BASE, SIZE).unwrap();
        let mut buf = [0u8; 8];
        let n = nv.read(&mut flash, 3, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"good");

        // The torn slot is skipped, not reused.
        nv.write(&mut flash, 3, b"next").unwrap();
        let n = nv.read(&mut flash, 3, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"next");
    }

    #[test]
    fn compaction_alternates_banks() {
        let mut mem = backing();
        let mut flash = RamFlash::new(0, &mut mem);
        let mut nv = NvStore::mount(&mut flash, BASE, SIZE).unwrap();
        let slots = nv.slots_per_bank();

        for i in 0..slots {
            nv.write(&mut flash, (i % 3) as u8, &i.to_le_bytes()).unwrap();
        }
        assert_eq!(nv.active_bank(), 0);
        assert_eq!(flash.erase_count(), 0);

        nv.write(&mut flash, 7, b"x").unwrap();
        assert_eq!(nv.active_bank(), 1);
        // one sector for the new bank, one for the old
        assert_eq!(flash.erase_count(), 2);

        for id in 0..3u32 {
            let newest = (0..slots).filter(|i| i % 3 == id).max().unwrap();
            let v: [u8; 4] = nv.read_record(&mut flash, id as u8).unwrap();
            assert_eq!(u32::from_le_bytes(v), newest);
        }

        // Fill bank 1 and watch it flip back.
        while nv.active_bank() == 1 {
            nv.write(&mut flash, 7, b"y").unwrap();
        }
        assert_eq!(nv.active_bank(), 0);
    }

    #[test]
    fn too_many_ids_is_full() {
        let mut mem = backing();
        let mut flash = RamFlash::new(0, &mut mem);
        let mut nv = NvStore::mount(&mut flash, BASE, SIZE).unwrap();
        for i in 0..nv.slots_per_bank() {
            nv.write(&mut flash, i as u8, b"v").unwrap();
        }
        assert_eq!(nv.write(&mut flash, 0xff, b"v"), Err(NvError::Full));
    }

    #[test]
    fn interrupted_compaction_loses_nothing() {
        let mut mem = backing();
        let mut flash = RamFlash::new(0, &mut mem);
        let mut nv = NvStore::mount(&mut flash, BASE, SIZE).unwrap();
        let slots = nv.slots_per_bank();
        for i in 0..slots {
            nv.write(&mut flash, (i % 2) as u8, &i.to_le_bytes()).unwrap();
        }

        // The compaction copies one record and then loses power.
        flash.fail_after_writes(1);
        assert!(nv.write(&mut flash, 5, b"z").is_err());
        flash.clear_fault();

        let mut nv = NvStore::mount(&mut flash, BASE, SIZE).unwrap();
        for id in 0..2u32 {
            let newest = (0..slots).filter(|i| i % 2 == id).max().unwrap();
            let v: [u8; 4] = nv.read_record(&mut flash, id as u8).unwrap();
            assert_eq!(u32::from_le_bytes(v), newest);
        }
        nv.write(&mut flash, 5, b"z").unwrap();
        let mut buf = [0u8; 1];
        nv.read(&mut flash, 5, &mut buf).unwrap();
        assert_eq!(&buf, b"z");
    }

    #[test]
    fn erase_all_forgets_everything() {
        let mut mem = backing();
        let mut flash = RamFlash::new(0, &mut mem);
        let mut nv = NvStore::mount(&mut flash, BASE, SIZE).unwrap();
        nv.write(&mut flash, 1, b"a").unwrap();
        nv.erase_all(&mut flash).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(nv.read(&mut flash, 1, &mut buf), Err(NvError::NotFound));
    }
}
