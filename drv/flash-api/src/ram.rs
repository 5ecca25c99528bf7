// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{Flash, FlashError, Geometry, SECTOR_SIZE};

/// NOR flash emulated over a RAM buffer.
///
/// Erase sets bytes to `0xff` and programming ANDs the new data into what is
/// already there, like the real part. A write can be made to fail part-way
/// through with [`RamFlash::fail_after_writes`], which leaves the first half
/// of that write programmed and the rest untouched.
pub struct RamFlash<'a> {
    base: u32,
    mem: &'a mut [u8],
    writes_before_fault: Option<u32>,
    erases: u32,
    writes: u32,
}

impl<'a> RamFlash<'a> {
    pub fn new(base: u32, mem: &'a mut [u8]) -> Self {
        Self {
            base,
            mem,
            writes_before_fault: None,
            erases: 0,
            writes: 0,
        }
    }

    /// Lets `n` more writes succeed; the one after that is torn and returns
    /// [`FlashError::WriteFailed`], as do all later writes until
    /// [`RamFlash::clear_fault`] is called.
    pub fn fail_after_writes(&mut self, n: u32) {
        self.writes_before_fault = Some(n);
    }

    pub fn clear_fault(&mut self) {
        self.writes_before_fault = None;
    }

    /// Number of sector erases performed so far.
    pub fn erase_count(&self) -> u32 {
        self.erases
    }

    /// Number of successful writes performed so far.
    pub fn write_count(&self) -> u32 {
        self.writes
    }

    /// The raw backing store, for inspecting what actually landed.
    pub fn contents(&self) -> &[u8] {
        self.mem
    }
}

impl Flash for RamFlash<'_> {
    fn geometry(&self) -> Geometry {
        Geometry {
            base: self.base,
            size: self.mem.len() as u32,
        }
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let off = self.geometry().offset_of(addr, buf.len())?;
        buf.copy_from_slice(&self.mem[off..off + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let off = self.geometry().offset_of(addr, data.len())?;
        let dst = &mut self.mem[off..off + data.len()];

        match self.writes_before_fault {
            Some(0) => {
                let torn = data.len() / 2;
                for (d, s) in dst[..torn].iter_mut().zip(data) {
                    *d &= *s;
                }
                return Err(FlashError::WriteFailed);
            }
            Some(ref mut n) => *n -= 1,
            None => (),
        }

        for (d, s) in dst.iter_mut().zip(data) {
            *d &= *s;
        }
        self.writes += 1;
        Ok(())
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
        if addr % SECTOR_SIZE != 0 || len % SECTOR_SIZE != 0 {
            return Err(FlashError::Unaligned);
        }
        let off = self.geometry().offset_of(addr, len as usize)?;
        self.mem[off..off + len as usize].fill(0xff);
        self.erases += len / SECTOR_SIZE;
        Ok(())
    }
}
