// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::EfuseError;

/// Bit-addressable view over a byte buffer.
///
/// Bit `pos` lives in byte `pos / 8` at bit `pos % 8`, least significant
/// bit first. This matches how both the efuse array and the upgrade
/// backup-slot bitmaps are laid out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BitSet<B> {
    bits: B,
}

impl<B: AsRef<[u8]>> BitSet<B> {
    pub fn new(bits: B) -> Self {
        Self { bits }
    }

    /// Number of addressable bits.
    pub fn len(&self) -> usize {
        self.bits.as_ref().len() * 8
    }

    pub fn is_empty(&self) -> bool {
        self.bits.as_ref().is_empty()
    }

    pub fn test(&self, pos: usize) -> Result<bool, EfuseError> {
        let byte = self
            .bits
            .as_ref()
            .get(pos / 8)
            .ok_or(EfuseError::OutOfRange)?;
        Ok(byte & (1 << (pos % 8)) != 0)
    }

    pub fn count_ones(&self) -> u32 {
        self.bits.as_ref().iter().map(|b| b.count_ones()).sum()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bits.as_ref()
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BitSet<B> {
    pub fn set(&mut self, pos: usize, val: bool) -> Result<(), EfuseError> {
        let byte = self
            .bits
            .as_mut()
            .get_mut(pos / 8)
            .ok_or(EfuseError::OutOfRange)?;
        if val {
            *byte |= 1 << (pos % 8);
        } else {
            *byte &= !(1 << (pos % 8));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lsb_first() {
        let mut b = BitSet::new([0u8; 2]);
        b.set(0, true).unwrap();
        b.set(9, true).unwrap();
        assert_eq!(b.as_bytes(), &[0x01, 0x02]);
        assert!(b.test(9).unwrap());
        assert!(!b.test(8).unwrap());
        b.set(0, false).unwrap();
        assert_eq!(b.as_bytes(), &[0x00, 0x02]);
    }

    #[test]
    fn out_of_range() {
        let mut b = BitSet::new([0u8; 2]);
        assert_eq!(b.test(16), Err(EfuseError::OutOfRange));
        assert_eq!(b.set(16, true), Err(EfuseError::OutOfRange));
        assert_eq!(b.len(), 16);
    }

    proptest! {
        #[test]
        fn set_only_touches_one_bit(
            init in proptest::collection::vec(any::<u8>(), 1..32),
            pos in 0usize..256,
            val in any::<bool>(),
        ) {
            let mut b = BitSet::new(init.clone());
            if pos >= b.len() {
                prop_assert_eq!(b.set(pos, val), Err(EfuseError::OutOfRange));
                return Ok(());
            }
            b.set(pos, val).unwrap();
            prop_assert_eq!(b.test(pos).unwrap(), val);
            for i in (0..b.len()).filter(|&i| i != pos) {
                let before = init[i / 8] & (1 << (i % 8)) != 0;
                prop_assert_eq!(b.test(i).unwrap(), before);
            }
        }
    }
}
