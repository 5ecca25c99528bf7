// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-flash header layouts. Everything is little-endian and unaligned, so
//! the headers can be read straight out of a byte buffer.

use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const HASH_LEN: usize = 32;

/// Leading header of an upgrade file.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct CommonHead {
    pub image_id: U32,
    pub struct_version: U32,
    /// Offset of the [`SectionHead`] from the start of the file.
    pub section_offset: U32,
    /// Length of the section header area.
    pub section_len: U32,
    pub section_count: U16,
    pub file_type: u8,
    pub file_version: u8,
    pub encrypt_flag: u8,
    pub file_attr: u8,
    pub reserved: [u8; 2],
    pub file_len: U32,
    pub user_info: [u8; 32],
    /// SHA-256 over `[section_offset, file_len)`.
    pub image_hash: [u8; HASH_LEN],
    pub reserved2: [u8; 4],
}

const_assert_eq!(core::mem::size_of::<CommonHead>(), 96);

/// Describes where the payload sections sit in the file.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct SectionHead {
    pub attribute: u8,
    pub reserved: [u8; 3],
    pub section0_offset: U32,
    /// Bytes section 0 occupies in the file when it is compressed.
    pub section0_compressed_len: U32,
    /// Length of section 0 once written back.
    pub section0_len: U32,
    pub section1_offset: U32,
    pub section1_len: U32,
    /// SHA-256 of section 0 as written back: decrypted and decompressed.
    pub section0_hash: [u8; HASH_LEN],
    pub reserved2: [u8; 8],
}

const_assert_eq!(core::mem::size_of::<SectionHead>(), 64);

pub const SECTION_ATTR_COMPRESSED: u8 = 1 << 0;

impl CommonHead {
    pub fn is_encrypted(&self) -> bool {
        self.encrypt_flag == crate::ENCRYPTED
    }
}

impl SectionHead {
    pub fn is_compressed(&self) -> bool {
        self.attribute & SECTION_ATTR_COMPRESSED != 0
    }

    /// Bytes section 0 occupies inside the upgrade file.
    pub fn section0_stored_len(&self) -> u32 {
        if self.is_compressed() {
            self.section0_compressed_len.get()
        } else {
            self.section0_len.get()
        }
    }
}
