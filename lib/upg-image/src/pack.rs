// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Staging an upgrade file into flash.

use crate::{
    hash_one_content, CommonHead, FileType, SectionHead, UpgError,
    COMMON_HEAD_LEN, ENCRYPTED, HASH_LEN, NOT_ENCRYPTED,
    PRODUCT_UPG_FILE_IMAGE_ID, SECTION_ATTR_COMPRESSED, SECTION_HEAD_LEN,
    UPG_STRUCT_VERSION,
};
use drv_flash_api::{erase_range, Flash, PAGE_SIZE};
use zerocopy::{FromZeros, IntoBytes};

/// Section 0 starts on the first page boundary after the headers.
const SECTION0_OFFSET: u32 = PAGE_SIZE;

/// Describes the file to stage. The payloads are passed separately, already
/// in their stored form (compressed and/or encrypted as flagged here).
#[derive(Copy, Clone, Debug)]
pub struct FileSpec {
    pub file_type: FileType,
    pub file_version: u8,
    pub encrypted: bool,
    pub compressed: bool,
    /// Length of section 0 once written back.
    pub section0_len: u32,
    /// SHA-256 of section 0 once written back.
    pub section0_hash: [u8; HASH_LEN],
}

/// Writes an upgrade file at `addr`, which must be sector aligned.
///
/// The common head goes in last, after the image hash has been computed
/// over what actually landed in flash, so a file interrupted part-way never
/// carries a valid magic.
pub fn write_file(
    flash: &mut impl Flash,
    addr: u32,
    spec: &FileSpec,
    section0: &[u8],
    section1: Option<&[u8]>,
) -> Result<CommonHead, UpgError> {
    let s0_stored = section0.len() as u32;
    let s1_offset = (SECTION0_OFFSET + s0_stored).next_multiple_of(16);
    let (section_count, file_len) = match (spec.file_type, section1) {
        (FileType::Code, None) => (1, SECTION0_OFFSET + s0_stored),
        (FileType::CodeAndNv, Some(nv)) => (2, s1_offset + nv.len() as u32),
        _ => return Err(UpgError::BadFileType),
    };

    let mut section = SectionHead::new_zeroed();
    if spec.compressed {
        section.attribute = SECTION_ATTR_COMPRESSED;
        section.section0_compressed_len.set(s0_stored);
    }
    section.section0_offset.set(SECTION0_OFFSET);
    section.section0_len.set(spec.section0_len);
    section.section0_hash = spec.section0_hash;
    if let Some(nv) = section1 {
        section.section1_offset.set(s1_offset);
        section.section1_len.set(nv.len() as u32);
    }

    erase_range(flash, addr, file_len)?;
    flash.write(addr + COMMON_HEAD_LEN, section.as_bytes())?;
    flash.write(addr + SECTION0_OFFSET, section0)?;
    if let Some(nv) = section1 {
        flash.write(addr + s1_offset, nv)?;
    }

    let mut common = CommonHead::new_zeroed();
    common.image_id.set(PRODUCT_UPG_FILE_IMAGE_ID);
    common.struct_version.set(UPG_STRUCT_VERSION);
    common.section_offset.set(COMMON_HEAD_LEN);
    common.section_len.set(SECTION_HEAD_LEN);
    common.section_count.set(section_count);
    common.file_type = spec.file_type as u8;
    common.file_version = spec.file_version;
    common.encrypt_flag = if spec.encrypted {
        ENCRYPTED
    } else {
        NOT_ENCRYPTED
    };
    common.file_len.set(file_len);
    common.image_hash = hash_one_content(
        flash,
        addr + COMMON_HEAD_LEN,
        file_len - COMMON_HEAD_LEN,
    )?;
    flash.write(addr, common.as_bytes())?;
    Ok(common)
}
