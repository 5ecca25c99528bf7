// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The binary range coder underneath LZMA.

use crate::{LzmaError, ReadAt, INPUT_CHUNK};

const TOP: u32 = 1 << 24;
const BIT_MODEL_TOTAL_BITS: u32 = 11;
const BIT_MODEL_TOTAL: u32 = 1 << BIT_MODEL_TOTAL_BITS;
const MOVE_BITS: u32 = 5;

pub struct RangeDecoder<'a, R: ReadAt + ?Sized> {
    src: &'a mut R,
    offset: u32,
    buf: [u8; INPUT_CHUNK],
    pos: usize,
    len: usize,
    range: u32,
    code: u32,
}

impl<'a, R: ReadAt + ?Sized> RangeDecoder<'a, R> {
    pub fn new(src: &'a mut R) -> Result<Self, LzmaError> {
        let mut rc = Self {
            src,
            offset: 0,
            buf: [0; INPUT_CHUNK],
            pos: 0,
            len: 0,
            range: u32::MAX,
            code: 0,
        };
        if rc.next_byte()? != 0 {
            return Err(LzmaError::Corrupt);
        }
        for _ in 0..4 {
            rc.code = (rc.code << 8) | u32::from(rc.next_byte()?);
        }
        if rc.code == rc.range {
            return Err(LzmaError::Corrupt);
        }
        Ok(rc)
    }

    fn next_byte(&mut self) -> Result<u8, LzmaError> {
        if self.pos == self.len {
            let n = self.src.read_at(self.offset, &mut self.buf)?;
            if n == 0 {
                return Err(LzmaError::SizeMismatch);
            }
            self.len = n.min(INPUT_CHUNK);
            self.offset += self.len as u32;
            self.pos = 0;
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn normalize(&mut self) -> Result<(), LzmaError> {
        if self.range < TOP {
            self.range <<= 8;
            self.code = (self.code << 8) | u32::from(self.next_byte()?);
        }
        Ok(())
    }

    /// Compressed bytes taken from the source so far.
    pub fn consumed(&self) -> u32 {
        self.offset - (self.len - self.pos) as u32
    }

    /// A stream that ends cleanly leaves the code register at zero.
    pub fn is_finished_ok(&self) -> bool {
        self.code == 0
    }

    pub fn bit(&mut self, prob: &mut u16) -> Result<u32, LzmaError> {
        let v = u32::from(*prob);
        let bound = (self.range >> BIT_MODEL_TOTAL_BITS) * v;
        let bit = if self.code < bound {
            *prob = (v + ((BIT_MODEL_TOTAL - v) >> MOVE_BITS)) as u16;
            self.range = bound;
            0
        } else {
            *prob = (v - (v >> MOVE_BITS)) as u16;
            self.code -= bound;
            self.range -= bound;
            1
        };
        self.normalize()?;
        Ok(bit)
    }

    pub fn direct_bits(&mut self, count: u32) -> Result<u32, LzmaError> {
        let mut res = 0;
        for _ in 0..count {
            self.range >>= 1;
            let bit = if self.code >= self.range {
                self.code -= self.range;
                1
            } else {
                0
            };
            res = (res << 1) | bit;
            self.normalize()?;
        }
        Ok(res)
    }

    /// Decodes a `bits`-wide symbol, most significant bit first. `probs[1..]`
    /// is the tree.
    pub fn bit_tree(
        &mut self,
        probs: &mut [u16],
        bits: u32,
    ) -> Result<u32, LzmaError> {
        let mut m = 1;
        for _ in 0..bits {
            m = (m << 1) | self.bit(&mut probs[m as usize])?;
        }
        Ok(m - (1 << bits))
    }

    /// Like [`Self::bit_tree`], least significant bit first.
    pub fn reverse_bit_tree(
        &mut self,
        probs: &mut [u16],
        bits: u32,
    ) -> Result<u32, LzmaError> {
        let mut m = 1;
        let mut sym = 0;
        for i in 0..bits {
            let bit = self.bit(&mut probs[m as usize])?;
            m = (m << 1) | bit;
            sym |= bit << i;
        }
        Ok(sym)
    }
}

pub struct RangeEncoder<F> {
    out: F,
    buf: [u8; INPUT_CHUNK],
    fill: usize,
    low: u64,
    range: u32,
    cache: u8,
    cache_size: u64,
}

impl<E, F: FnMut(&[u8]) -> Result<(), E>> RangeEncoder<F> {
    pub fn new(out: F) -> Self {
        Self {
            out,
            buf: [0; INPUT_CHUNK],
            fill: 0,
            low: 0,
            range: u32::MAX,
            cache: 0,
            cache_size: 1,
        }
    }

    fn put(&mut self, b: u8) -> Result<(), E> {
        self.buf[self.fill] = b;
        self.fill += 1;
        if self.fill == self.buf.len() {
            (self.out)(&self.buf)?;
            self.fill = 0;
        }
        Ok(())
    }

    fn shift_low(&mut self) -> Result<(), E> {
        if (self.low as u32) < 0xff00_0000 || (self.low >> 32) != 0 {
            let carry = (self.low >> 32) as u8;
            let mut temp = self.cache;
            loop {
                self.put(temp.wrapping_add(carry))?;
                temp = 0xff;
                self.cache_size -= 1;
                if self.cache_size == 0 {
                    break;
                }
            }
            self.cache = (self.low >> 24) as u8;
        }
        self.cache_size += 1;
        self.low = (self.low & 0x00ff_ffff) << 8;
        Ok(())
    }

    pub fn bit(&mut self, prob: &mut u16, bit: u32) -> Result<(), E> {
        let v = u32::from(*prob);
        let bound = (self.range >> BIT_MODEL_TOTAL_BITS) * v;
        if bit == 0 {
            self.range = bound;
            *prob = (v + ((BIT_MODEL_TOTAL - v) >> MOVE_BITS)) as u16;
        } else {
            self.low += u64::from(bound);
            self.range -= bound;
            *prob = (v - (v >> MOVE_BITS)) as u16;
        }
        while self.range < TOP {
            self.range <<= 8;
            self.shift_low()?;
        }
        Ok(())
    }

    pub fn direct_bits(&mut self, value: u32, count: u32) -> Result<(), E> {
        for i in (0..count).rev() {
            self.range >>= 1;
            if (value >> i) & 1 != 0 {
                self.low += u64::from(self.range);
            }
            while self.range < TOP {
                self.range <<= 8;
                self.shift_low()?;
            }
        }
        Ok(())
    }

    pub fn bit_tree(
        &mut self,
        probs: &mut [u16],
        bits: u32,
        value: u32,
    ) -> Result<(), E> {
        let mut m = 1;
        for i in (0..bits).rev() {
            let bit = (value >> i) & 1;
            self.bit(&mut probs[m as usize], bit)?;
            m = (m << 1) | bit;
        }
        Ok(())
    }

    pub fn reverse_bit_tree(
        &mut self,
        probs: &mut [u16],
        bits: u32,
        mut value: u32,
    ) -> Result<(), E> {
        let mut m = 1;
        for _ in 0..bits {
            let bit = value & 1;
            value >>= 1;
            self.bit(&mut probs[m as usize], bit)?;
            m = (m << 1) | bit;
        }
        Ok(())
    }

    /// Pushes out every pending byte. The encoder is done after this.
    pub fn finish(mut self) -> Result<(), E> {
        for _ in 0..5 {
            self.shift_low()?;
        }
        if self.fill > 0 {
            (self.out)(&self.buf[..self.fill])?;
        }
        Ok(())
    }
}
