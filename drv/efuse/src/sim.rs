// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{
    check_range, BitSet, Efuse, EfuseError, EFUSE_BITS, EFUSE_WORDS,
};

/// Efuse array held in RAM, with the same write-once and lock rules as the
/// hardware.
#[derive(Clone, Debug)]
pub struct SimEfuse {
    bits: BitSet<[u8; EFUSE_BITS as usize / 8]>,
    locks: BitSet<[u8; EFUSE_WORDS / 8]>,
}

impl Default for SimEfuse {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEfuse {
    pub fn new() -> Self {
        Self {
            bits: BitSet::new([0; EFUSE_BITS as usize / 8]),
            locks: BitSet::new([0; EFUSE_WORDS / 8]),
        }
    }

    /// The raw array, for checking what a burn actually changed.
    pub fn raw(&self) -> &[u8] {
        self.bits.as_bytes()
    }
}

impl Efuse for SimEfuse {
    fn read_bits(
        &mut self,
        start_bit: u16,
        width: u16,
        buf: &mut [u8],
    ) -> Result<(), EfuseError> {
        check_range(start_bit, width, buf.len())?;
        buf.fill(0);
        let mut out = BitSet::new(buf);
        for i in 0..usize::from(width) {
            let bit = self.bits.test(usize::from(start_bit) + i)?;
            out.set(i, bit)?;
        }
        Ok(())
    }

    fn burn_bits(
        &mut self,
        start_bit: u16,
        width: u16,
        value: &[u8],
    ) -> Result<(), EfuseError> {
        check_range(start_bit, width, value.len())?;
        let first = usize::from(start_bit) / 32;
        let last = (usize::from(start_bit) + usize::from(width) - 1) / 32;
        for word in first..=last {
            if self.is_locked(word)? {
                return Err(EfuseError::Locked);
            }
        }

        let value = BitSet::new(value);
        for i in 0..usize::from(width) {
            if value.test(i)? {
                self.bits.set(usize::from(start_bit) + i, true)?;
            }
        }
        Ok(())
    }

    fn lock_word(&mut self, word: usize) -> Result<(), EfuseError> {
        self.locks.set(word, true)
    }

    fn is_locked(&self, word: usize) -> Result<bool, EfuseError> {
        self.locks.test(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burn_is_write_once() {
        let mut e = SimEfuse::new();
        e.burn_bits(3, 4, &[0b1010]).unwrap();
        // burning zeros over ones changes nothing
        e.burn_bits(3, 4, &[0b0101]).unwrap();
        let mut out = [0u8];
        e.read_bits(3, 4, &mut out).unwrap();
        assert_eq!(out, [0b1111]);
    }

    #[test]
    fn unaligned_read_spanning_bytes() {
        let mut e = SimEfuse::new();
        e.burn_bits(6, 12, &[0xff, 0x0f]).unwrap();
        let mut out = [0u8; 2];
        e.read_bits(4, 16, &mut out).unwrap();
        assert_eq!(out, [0b1111_1100, 0b0011_1111]);
    }

    #[test]
    fn locked_word_rejects_burn_and_changes_nothing() {
        let mut e = SimEfuse::new();
        e.burn_bits(32, 4, &[0b0001]).unwrap();
        e.lock_word(1).unwrap();
        let before = e.raw().to_vec();

        // Entirely inside the locked word.
        assert_eq!(e.burn_bits(36, 4, &[0xf]), Err(EfuseError::Locked));
        // Straddling an unlocked and the locked word: nothing may land in
        // the unlocked half either.
        assert_eq!(e.burn_bits(28, 8, &[0xff]), Err(EfuseError::Locked));
        assert_eq!(e.raw(), &before[..]);

        // Neighbours stay writeable.
        e.burn_bits(64, 1, &[1]).unwrap();
    }

    #[test]
    fn lock_index_out_of_range() {
        let mut e = SimEfuse::new();
        assert_eq!(e.lock_word(EFUSE_WORDS), Err(EfuseError::OutOfRange));
    }
}
