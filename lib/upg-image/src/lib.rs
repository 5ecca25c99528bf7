// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Upgrade file validation.
//!
//! An upgrade file is staged in flash by the kernel (or by the serial
//! loader) and checked here before the boot stage writes anything back.
//! The layout is
//!
//! ```text
//! +------------+---------------+-------------------+-------------------+
//! | CommonHead | SectionHead   | section 0         | section 1 (opt.)  |
//! +------------+---------------+-------------------+-------------------+
//! ^ addr       ^ section_offset ^ section0_offset   ^ section1_offset
//! ```
//!
//! All offsets are relative to the start of the file. Nothing in a staged
//! file is trusted: every offset and length is bounds-checked against
//! `file_len` before it is used to address flash.

#![cfg_attr(not(test), no_std)]

use drv_flash_api::{hash_range, sector_align_up, Flash, FlashError};
use partition_table::Region;
use ringbuf::{ringbuf, ringbuf_entry};
use sha2::{Digest, Sha256};
use zerocopy::FromBytes;

mod header;
mod pack;

pub use drv_efuse::BitSet;
pub use header::{CommonHead, SectionHead, HASH_LEN, SECTION_ATTR_COMPRESSED};
pub use pack::{write_file, FileSpec};

pub const PRODUCT_UPG_FILE_IMAGE_ID: u32 = 0x3C78_961E;
pub const UPG_STRUCT_VERSION: u32 = 1;
/// Highest kernel version the anti-rollback efuse field can express.
pub const KERNEL_VER_MAX: u8 = 48;
pub const MAX_SECTIONS: u16 = 2;

/// `encrypt_flag` value of a file whose section 0 is encrypted.
pub const ENCRYPTED: u8 = 0x42;
pub const NOT_ENCRYPTED: u8 = 0;

pub const COMMON_HEAD_LEN: u32 = core::mem::size_of::<CommonHead>() as u32;
pub const SECTION_HEAD_LEN: u32 = core::mem::size_of::<SectionHead>() as u32;

/// Cipher block size; encrypted payloads must be a multiple of it.
pub const CIPHER_BLOCK: u32 = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FileType {
    /// Kernel image only.
    Code = 0xF0,
    /// Kernel image followed by an NV image in section 1.
    CodeAndNv = 0xF1,
}

impl FileType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0xF0 => Some(FileType::Code),
            0xF1 => Some(FileType::CodeAndNv),
            _ => None,
        }
    }

    fn section_count(self) -> u16 {
        match self {
            FileType::Code => 1,
            FileType::CodeAndNv => 2,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpgError {
    BadMagic,
    /// Unknown header struct version.
    BadVersion,
    BadFileType,
    BadEncryptFlag,
    NoSections,
    TooManySections,
    /// An offset or length points outside the file or the target.
    OutOfBounds,
    BadLength,
    /// The write-back output would overwrite the staged file.
    Overlap,
    HashMismatch,
    VersionTooOld,
    VersionTooNew,
    /// Bit position past the end of a bitmap.
    BitRange,
    Flash(FlashError),
}

impl From<FlashError> for UpgError {
    fn from(e: FlashError) -> Self {
        UpgError::Flash(e)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    CommonHead { addr: u32, file_len: u32, version: u8 },
    SectionHead { s0_offset: u32, s0_len: u32, compressed: bool },
    Rejected(UpgError),
    HashOk,
}

ringbuf!(Trace, 16, Trace::None);

pub fn get_common_head(
    flash: &mut impl Flash,
    addr: u32,
) -> Result<CommonHead, UpgError> {
    let mut buf = [0u8; COMMON_HEAD_LEN as usize];
    flash.read(addr, &mut buf)?;
    let head = CommonHead::read_from_bytes(&buf[..])
        .map_err(|_| UpgError::BadLength)?;
    ringbuf_entry!(Trace::CommonHead {
        addr,
        file_len: head.file_len.get(),
        version: head.file_version,
    });
    Ok(head)
}

/// Reads the section header of the file at `addr`. The header location is
/// checked against `common.file_len` before anything is read.
pub fn get_section_head(
    flash: &mut impl Flash,
    addr: u32,
    common: &CommonHead,
) -> Result<SectionHead, UpgError> {
    let offset = common.section_offset.get();
    if !within(offset, SECTION_HEAD_LEN, common.file_len.get()) {
        return Err(UpgError::OutOfBounds);
    }
    let mut buf = [0u8; SECTION_HEAD_LEN as usize];
    flash.read(addr + offset, &mut buf)?;
    let head = SectionHead::read_from_bytes(&buf[..])
        .map_err(|_| UpgError::BadLength)?;
    ringbuf_entry!(Trace::SectionHead {
        s0_offset: head.section0_offset.get(),
        s0_len: head.section0_len.get(),
        compressed: head.is_compressed(),
    });
    Ok(head)
}

/// True if `[offset, offset + len)` lies inside a file of `file_len` bytes.
fn within(offset: u32, len: u32, file_len: u32) -> bool {
    offset.checked_add(len).is_some_and(|end| end <= file_len)
}

pub fn check_common_head(head: &CommonHead) -> Result<(), UpgError> {
    if head.image_id.get() != PRODUCT_UPG_FILE_IMAGE_ID {
        return Err(UpgError::BadMagic);
    }
    if head.struct_version.get() != UPG_STRUCT_VERSION {
        return Err(UpgError::BadVersion);
    }
    let count = head.section_count.get();
    if count == 0 {
        return Err(UpgError::NoSections);
    }
    if count > MAX_SECTIONS {
        return Err(UpgError::TooManySections);
    }
    let file_type =
        FileType::from_u8(head.file_type).ok_or(UpgError::BadFileType)?;
    if file_type.section_count() != count {
        return Err(UpgError::BadFileType);
    }
    if head.encrypt_flag != ENCRYPTED && head.encrypt_flag != NOT_ENCRYPTED {
        return Err(UpgError::BadEncryptFlag);
    }
    if head.file_version > KERNEL_VER_MAX {
        return Err(UpgError::VersionTooNew);
    }
    if head.section_offset.get() < COMMON_HEAD_LEN
        || head.section_len.get() < SECTION_HEAD_LEN
    {
        return Err(UpgError::BadLength);
    }
    if !within(
        head.section_offset.get(),
        head.section_len.get(),
        head.file_len.get(),
    ) {
        return Err(UpgError::OutOfBounds);
    }
    Ok(())
}

/// Checks that the payload sections sit inside the file, behind the
/// headers, and have sane lengths.
pub fn check_section_head(
    common: &CommonHead,
    section: &SectionHead,
) -> Result<(), UpgError> {
    let file_len = common.file_len.get();
    let payload_start =
        common.section_offset.get() + common.section_len.get();

    let s0_offset = section.section0_offset.get();
    let s0_stored = section.section0_stored_len();
    if section.section0_len.get() == 0 || s0_stored == 0 {
        return Err(UpgError::BadLength);
    }
    if s0_offset < payload_start || !within(s0_offset, s0_stored, file_len) {
        return Err(UpgError::OutOfBounds);
    }
    if common.is_encrypted() && s0_stored % CIPHER_BLOCK != 0 {
        return Err(UpgError::BadLength);
    }

    if common.section_count.get() == 2 {
        let s1_offset = section.section1_offset.get();
        let s1_len = section.section1_len.get();
        if s1_len == 0 {
            return Err(UpgError::BadLength);
        }
        if s1_offset < s0_offset + s0_stored
            || !within(s1_offset, s1_len, file_len)
        {
            return Err(UpgError::OutOfBounds);
        }
    }
    Ok(())
}

/// SHA-256 of `len` bytes of flash at `addr`.
pub fn hash_one_content(
    flash: &mut impl Flash,
    addr: u32,
    len: u32,
) -> Result<[u8; HASH_LEN], UpgError> {
    let mut hasher = Sha256::new();
    hash_range(flash, addr, len, &mut hasher)?;
    Ok(hasher.finalize().into())
}

/// SHA-256 of several `(addr, len)` ranges of flash, in order, as one
/// message.
pub fn hash_more_content(
    flash: &mut impl Flash,
    ranges: &[(u32, u32)],
) -> Result<[u8; HASH_LEN], UpgError> {
    let mut hasher = Sha256::new();
    for &(addr, len) in ranges {
        hash_range(flash, addr, len, &mut hasher)?;
    }
    Ok(hasher.finalize().into())
}

/// Validates the upgrade file at `addr`, which may occupy at most `max_len`
/// bytes of flash.
///
/// The common head is checked before any other part of the file is read, so
/// a file with a bad magic costs exactly one header read.
pub fn check_file(
    flash: &mut impl Flash,
    addr: u32,
    max_len: u32,
) -> Result<(CommonHead, SectionHead), UpgError> {
    let r = check_file_inner(flash, addr, max_len);
    if let Err(e) = r {
        ringbuf_entry!(Trace::Rejected(e));
    }
    r
}

fn check_file_inner(
    flash: &mut impl Flash,
    addr: u32,
    max_len: u32,
) -> Result<(CommonHead, SectionHead), UpgError> {
    let common = get_common_head(flash, addr)?;
    check_common_head(&common)?;
    let file_len = common.file_len.get();
    if file_len > max_len {
        return Err(UpgError::OutOfBounds);
    }

    let section = get_section_head(flash, addr, &common)?;
    check_section_head(&common, &section)?;

    let offset = common.section_offset.get();
    let digest = hash_one_content(flash, addr + offset, file_len - offset)?;
    if digest != common.image_hash {
        return Err(UpgError::HashMismatch);
    }
    ringbuf_entry!(Trace::HashOk);
    Ok((common, section))
}

/// Anti-rollback check: a file may not go below the version burned into
/// efuse, nor above what the efuse field can record.
pub fn check_code_ver(
    file_version: u8,
    efuse_version: u8,
) -> Result<(), UpgError> {
    if file_version < efuse_version {
        return Err(UpgError::VersionTooOld);
    }
    if file_version > KERNEL_VER_MAX {
        return Err(UpgError::VersionTooNew);
    }
    Ok(())
}

/// Checks that writing section 0 back to the start of `target` stays inside
/// `target` and does not touch the staged file. The output is erased a
/// whole sector at a time, so the check covers the rounded-up range.
pub fn check_before_decompress(
    target: Region,
    staged: Region,
    section: &SectionHead,
) -> Result<(), UpgError> {
    let out = Region {
        base: target.base,
        size: sector_align_up(section.section0_len.get()),
    };
    if !target.contains_range(out.base, out.size) {
        return Err(UpgError::OutOfBounds);
    }
    if out.overlaps(&staged) {
        return Err(UpgError::Overlap);
    }
    Ok(())
}

/// Tests bit `pos` of a slot bitmap.
pub fn bit_test(bits: &[u8], pos: usize) -> Result<bool, UpgError> {
    BitSet::new(bits).test(pos).map_err(|_| UpgError::BitRange)
}

pub fn bit_set(bits: &mut [u8], pos: usize, val: bool) -> Result<(), UpgError> {
    BitSet::new(bits).set(pos, val).map_err(|_| UpgError::BitRange)
}
