// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Efuse (one-time programmable) driver API.
//!
//! The efuse array is 2048 bits, addressed LSB-first as a [`BitSet`].
//! Burning can only set bits. Each 32-bit word also has a lock bit; once a
//! word is locked the driver refuses any further burn that touches it, and
//! such a burn leaves the whole array untouched.

#![cfg_attr(not(test), no_std)]


mod bitset;
mod config;
mod sim;

pub use bitset::BitSet;
pub use config::{burn_config, ConfigHeader, ConfigItem};
pub use sim::SimEfuse;

pub const EFUSE_BITS: u16 = 2048;
pub const EFUSE_WORDS: usize = EFUSE_BITS as usize / 32;
/// Largest single read, in bits.
pub const EFUSE_READ_MAX_BITS: u16 = 256;

/// Number of 2-bit flash-encryption counters.
pub const ENCRYPT_COUNTERS: usize = 6;
/// Width of the kernel anti-rollback field.
pub const KERNEL_VER_BITS: u16 = 48;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum EfuseError {
    OutOfRange = 1,
    BadWidth,
    Locked,
    Io,
    BadConfigHash,
    BadConfigFormat,
}

pub trait Efuse {
    /// Reads `width` bits starting at `start_bit` into `buf`, LSB-first.
    /// Bits of `buf` past `width` are cleared.
    fn read_bits(
        &mut self,
        start_bit: u16,
        width: u16,
        buf: &mut [u8],
    ) -> Result<(), EfuseError>;

    /// Burns the set bits of the first `width` bits of `value` starting at
    /// `start_bit`. Fails with [`EfuseError::Locked`] if any word in the
    /// range is locked.
    fn burn_bits(
        &mut self,
        start_bit: u16,
        width: u16,
        value: &[u8],
    ) -> Result<(), EfuseError>;

    fn lock_word(&mut self, word: usize) -> Result<(), EfuseError>;

    fn is_locked(&self, word: usize) -> Result<bool, EfuseError>;
}

/// Checks a bit range the way every driver operation does.
pub fn check_range(
    start_bit: u16,
    width: u16,
    buf_len: usize,
) -> Result<(), EfuseError> {
    if width == 0 || width > EFUSE_READ_MAX_BITS {
        return Err(EfuseError::BadWidth);
    }
    if u32::from(start_bit) + u32::from(width) > u32::from(EFUSE_BITS) {
        return Err(EfuseError::OutOfRange);
    }
    if buf_len * 8 < usize::from(width) {
        return Err(EfuseError::BadWidth);
    }
    Ok(())
}

/// Named fields of the efuse map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EfuseField {
    ChipId,
    /// Per-device salt mixed into the flash encryption root key.
    RootSalt,
    /// Anti-rollback kernel version, as a thermometer code.
    KernelVersion,
    FlashEncryptEnable,
    EncryptCounter(u8),
}

impl EfuseField {
    /// `(start_bit, width)`.
    pub fn location(self) -> (u16, u16) {
        match self {
            EfuseField::ChipId => (0, 8),
            EfuseField::RootSalt => (256, 256),
            EfuseField::KernelVersion => (512, KERNEL_VER_BITS),
            EfuseField::FlashEncryptEnable => (576, 1),
            EfuseField::EncryptCounter(i) => (580 + 2 * u16::from(i), 2),
        }
    }
}

pub fn read_field(
    efuse: &mut impl Efuse,
    field: EfuseField,
    buf: &mut [u8],
) -> Result<(), EfuseError> {
    if let EfuseField::EncryptCounter(i) = field {
        if usize::from(i) >= ENCRYPT_COUNTERS {
            return Err(EfuseError::OutOfRange);
        }
    }
    let (start, width) = field.location();
    efuse.read_bits(start, width, buf)
}

/// Current anti-rollback kernel version: the number of burned bits in the
/// kernel version field.
pub fn kernel_version(efuse: &mut impl Efuse) -> Result<u8, EfuseError> {
    let mut buf = [0u8; KERNEL_VER_BITS as usize / 8];
    read_field(efuse, EfuseField::KernelVersion, &mut buf)?;
    Ok(BitSet::new(buf).count_ones() as u8)
}

/// Index of the first flash-encryption counter that still has an unburned
/// bit, or `None` once all of them are used up.
pub fn writeable_encrypt_counter(
    efuse: &mut impl Efuse,
) -> Result<Option<u8>, EfuseError> {
    for i in 0..ENCRYPT_COUNTERS as u8 {
        let mut v = [0u8];
        read_field(efuse, EfuseField::EncryptCounter(i), &mut v)?;
        if v[0] & 0b11 != 0b11 {
            return Ok(Some(i));
        }
    }
    Ok(None)
}
