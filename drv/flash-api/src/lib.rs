// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API for the boot flash.
//!
//! The boot stages talk to the SPI NOR flash through the [`Flash`] trait:
//! byte-granular reads and writes (a write can only clear bits, as with any
//! NOR part) and sector-granular erase. Every call is fallible and callers
//! are expected to check every result.
//!
//! [`RamFlash`] implements the same semantics over a RAM buffer for host
//! builds and tests, including fault injection for power-loss scenarios.

#![cfg_attr(not(test), no_std)]

use ringbuf::{ringbuf, ringbuf_entry};

mod ram;

pub use ram::RamFlash;

/// Program granularity used by the chunked helpers below.
pub const PAGE_SIZE: u32 = 0x100;

/// Smallest erasable unit.
pub const SECTOR_SIZE: u32 = 0x1000;

/// Bit in status register 2 that enables quad I/O mode.
pub const STATUS2_QE: u8 = 1 << 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum FlashError {
    OutOfBounds = 1,
    Unaligned,
    Io,
    WriteFailed,
    EraseFailed,
    /// The QE bit did not read back as set after being written.
    QuadEnableNotLatched,
}

/// Size and placement of a flash device in the address space the boot
/// stages use.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    pub base: u32,
    pub size: u32,
}

impl Geometry {
    pub fn end(&self) -> u32 {
        self.base + self.size
    }

    /// Checks that `[addr, addr + len)` lies within the device and returns
    /// the offset of `addr` from the device base.
    pub fn offset_of(
        &self,
        addr: u32,
        len: usize,
    ) -> Result<usize, FlashError> {
        let len = u32::try_from(len).map_err(|_| FlashError::OutOfBounds)?;
        let end = addr.checked_add(len).ok_or(FlashError::OutOfBounds)?;
        if addr < self.base || end > self.end() {
            return Err(FlashError::OutOfBounds);
        }
        Ok((addr - self.base) as usize)
    }
}

pub trait Flash {
    fn geometry(&self) -> Geometry;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Programs `data` at `addr`. The target bytes must have been erased;
    /// programming can only clear bits.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Erases `len` bytes at `addr`. Both must be multiples of
    /// [`SECTOR_SIZE`].
    fn erase(&mut self, addr: u32, len: u32) -> Result<(), FlashError>;
}

impl<F: Flash + ?Sized> Flash for &mut F {
    fn geometry(&self) -> Geometry {
        (**self).geometry()
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(addr, buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).write(addr, data)
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
        (**self).erase(addr, len)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    EraseRange { addr: u32, len: u32 },
    Copy { src: u32, dst: u32, len: u32 },
    QuadEnable { status: u8 },
    QuadEnableAlreadySet,
    QuadEnableReadback { status: u8 },
}

ringbuf!(Trace, 16, Trace::None);

/// Rounds `len` up to a whole number of sectors.
pub const fn sector_align_up(len: u32) -> u32 {
    (len + SECTOR_SIZE - 1) & !(SECTOR_SIZE - 1)
}

pub fn is_sector_aligned(addr: u32) -> bool {
    addr % SECTOR_SIZE == 0
}

/// Erases every sector touched by `[addr, addr + len)`. `addr` must be
/// sector aligned.
pub fn erase_range(
    flash: &mut impl Flash,
    addr: u32,
    len: u32,
) -> Result<(), FlashError> {
    if !is_sector_aligned(addr) {
        return Err(FlashError::Unaligned);
    }
    let len = sector_align_up(len);
    ringbuf_entry!(Trace::EraseRange { addr, len });
    flash.erase(addr, len)
}

/// Copies `len` bytes from `src` to `dst` one page at a time. The
/// destination must already be erased and must not overlap the source.
pub fn copy_range(
    flash: &mut impl Flash,
    src: u32,
    dst: u32,
    len: u32,
) -> Result<(), FlashError> {
    if src < dst.saturating_add(len) && dst < src.saturating_add(len) {
        return Err(FlashError::OutOfBounds);
    }
    ringbuf_entry!(Trace::Copy { src, dst, len });

    let mut buf = [0u8; PAGE_SIZE as usize];
    let mut done = 0;
    while done < len {
        let n = (len - done).min(PAGE_SIZE);
        let chunk = &mut buf[..n as usize];
        flash.read(src + done, chunk)?;
        flash.write(dst + done, chunk)?;
        done += n;
    }
    Ok(())
}

/// Feeds `len` bytes of flash starting at `addr` into `hasher`, one page at
/// a time.
pub fn hash_range(
    flash: &mut impl Flash,
    addr: u32,
    len: u32,
    hasher: &mut impl digest::Update,
) -> Result<(), FlashError> {
    let mut buf = [0u8; PAGE_SIZE as usize];
    let mut done = 0;
    while done < len {
        let n = (len - done).min(PAGE_SIZE);
        let chunk = &mut buf[..n as usize];
        flash.read(addr + done, chunk)?;
        hasher.update(chunk);
        done += n;
    }
    Ok(())
}

/// Access to the flash part's second status register, which holds the
/// quad-enable bit.
pub trait StatusRegister {
    fn read_status2(&mut self) -> Result<u8, FlashError>;
    fn write_status2(&mut self, value: u8) -> Result<(), FlashError>;
}

impl<S: StatusRegister + ?Sized> StatusRegister for &mut S {
    fn read_status2(&mut self) -> Result<u8, FlashError> {
        (**self).read_status2()
    }

    fn write_status2(&mut self, value: u8) -> Result<(), FlashError> {
        (**self).write_status2(value)
    }
}

/// Sets the QE bit in status register 2.
///
/// Writing is skipped when the bit is already set. After a write the
/// register is read back; a bit that did not latch is reported as
/// [`FlashError::QuadEnableNotLatched`] rather than as success.
pub fn set_quad_enable(
    status: &mut impl StatusRegister,
) -> Result<(), FlashError> {
    let current = status.read_status2()?;
    if current & STATUS2_QE != 0 {
        ringbuf_entry!(Trace::QuadEnableAlreadySet);
        return Ok(());
    }

    let value = current | STATUS2_QE;
    ringbuf_entry!(Trace::QuadEnable { status: value });
    status.write_status2(value)?;

    let readback = status.read_status2()?;
    ringbuf_entry!(Trace::QuadEnableReadback { status: readback });
    if readback & STATUS2_QE == 0 {
        return Err(FlashError::QuadEnableNotLatched);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    struct FakeStatus {
        value: u8,
        latches: bool,
        writes: usize,
    }

    impl StatusRegister for FakeStatus {
        fn read_status2(&mut self) -> Result<u8, FlashError> {
            Ok(self.value)
        }

        fn write_status2(&mut self, value: u8) -> Result<(), FlashError> {
            self.writes += 1;
            if self.latches {
                self.value = value;
            }
            Ok(())
        }
    }

    #[test]
    fn quad_enable_sets_bit_preserving_others() {
        let mut s = FakeStatus {
            value: 0x40,
            latches: true,
            writes: 0,
        };
        set_quad_enable(&mut s).unwrap();
        assert_eq!(s.value, 0x40 | STATUS2_QE);
        assert_eq!(s.writes, 1);
    }

    #[test]
    fn quad_enable_already_set_is_idempotent() {
        let mut s = FakeStatus {
            value: STATUS2_QE,
            latches: true,
            writes: 0,
        };
        set_quad_enable(&mut s).unwrap();
        set_quad_enable(&mut s).unwrap();
        assert_eq!(s.writes, 0);
    }

    #[test]
    fn quad_enable_that_does_not_latch_is_an_error() {
        let mut s = FakeStatus {
            value: 0,
            latches: false,
            writes: 0,
        };
        assert_eq!(
            set_quad_enable(&mut s),
            Err(FlashError::QuadEnableNotLatched)
        );
    }

    #[test]
    fn geometry_bounds() {
        let g = Geometry {
            base: 0x1000,
            size: 0x2000,
        };
        assert_eq!(g.offset_of(0x1000, 0x2000), Ok(0));
        assert_eq!(g.offset_of(0x2fff, 1), Ok(0x1fff));
        assert_eq!(g.offset_of(0x2fff, 2), Err(FlashError::OutOfBounds));
        assert_eq!(g.offset_of(0xfff, 1), Err(FlashError::OutOfBounds));
        assert_eq!(g.offset_of(u32::MAX, 2), Err(FlashError::OutOfBounds));
    }

    #[test]
    fn copy_and_hash() {
        let mut mem = vec![0xffu8; 0x4000];
        let mut flash = RamFlash::new(0, &mut mem);
        let data: Vec<u8> = (0..0x300u32).map(|i| (i * 7) as u8).collect();
        flash.write(0x10, &data).unwrap();

        copy_range(&mut flash, 0x10, 0x2000, data.len() as u32).unwrap();
        let mut back = vec![0; data.len()];
        flash.read(0x2000, &mut back).unwrap();
        assert_eq!(back, data);

        let mut h = Sha256::new();
        hash_range(&mut flash, 0x2000, data.len() as u32, &mut h).unwrap();
        assert_eq!(h.finalize(), Sha256::digest(&data));
    }

    #[test]
    fn overlapping_copy_is_refused() {
        let mut mem = vec![0xffu8; 0x2000];
        let mut flash = RamFlash::new(0, &mut mem);
        assert_eq!(
            copy_range(&mut flash, 0x100, 0x180, 0x100),
            Err(FlashError::OutOfBounds)
        );
    }

    #[test]
    fn erase_range_rounds_to_sectors() {
        let mut mem = vec![0u8; 0x3000];
        let mut flash = RamFlash::new(0, &mut mem);
        erase_range(&mut flash, 0x1000, 1).unwrap();
        let mut b = [0u8; 4];
        flash.read(0x1ffc, &mut b).unwrap();
        assert_eq!(b, [0xff; 4]);
        flash.read(0x2000, &mut b).unwrap();
        assert_eq!(b, [0; 4]);
        assert_eq!(
            erase_range(&mut flash, 0x10, 1),
            Err(FlashError::Unaligned)
        );
    }
}
