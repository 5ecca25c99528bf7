// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! LZMA ("LZMA-alone" / `.lzma`) decompression for the boot stage, plus a
//! matching encoder for packaging.
//!
//! The decoder does not allocate. Callers first look at the 13-byte header
//! with [`get_uncompress_len`] and [`mem_detect`], provide a [`Workspace`]
//! of at least that size, and then stream the compressed data through
//! [`decompress`]. Input and output go through [`ReadAt`] and [`WriteAt`],
//! so an image can be decompressed flash-to-flash with only the dictionary
//! held in RAM.
//!
//! Header layout:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 1    | properties, `lc + lp * 9 + pb * 45`     |
//! | 1      | 4    | dictionary size, little-endian          |
//! | 5      | 8    | uncompressed size, little-endian        |

#![cfg_attr(not(test), no_std)]


mod decode;
mod encode;
mod model;
mod rc;

pub use decode::decompress;
pub use encode::{compress, ENCODER_DICT_SIZE};

pub const HEADER_LEN: usize = 13;

/// Uncompressed size value meaning "not recorded, look for an end marker".
pub const UNKNOWN_SIZE: u64 = u64::MAX;

/// Smallest dictionary the decoder will work with.
pub const DICT_MIN: u32 = 1 << 12;

/// Compressed input is pulled in chunks of this many bytes.
pub const INPUT_CHUNK: usize = 256;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum LzmaError {
    /// Header too short, or its size is not usable.
    BadHeader = 1,
    /// `lc`/`lp`/`pb` out of range.
    BadProperties,
    /// The stream decodes to something impossible.
    Corrupt,
    /// The stream ended before producing the declared number of bytes.
    SizeMismatch,
    /// The output sink has no room at the offset being written.
    OutputTooSmall,
    /// The workspace is smaller than [`mem_detect`] asked for.
    Workspace,
    /// The input source failed.
    Input,
    /// The output sink failed or accepted fewer bytes than offered.
    Output,
}

/// Literal context/position properties.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Props {
    lc: u8,
    lp: u8,
    pb: u8,
}

impl Props {
    /// `lc = 3, lp = 0, pb = 2`, the usual choice.
    pub const DEFAULT: Props = Props {
        lc: 3,
        lp: 0,
        pb: 2,
    };

    /// `lc + lp` is capped at 4 to bound the literal tables.
    pub fn new(lc: u8, lp: u8, pb: u8) -> Result<Self, LzmaError> {
        if lc > 8 || lp > 4 || pb > 4 || lc + lp > 4 {
            return Err(LzmaError::BadProperties);
        }
        Ok(Self { lc, lp, pb })
    }

    pub fn from_byte(b: u8) -> Result<Self, LzmaError> {
        if b >= 9 * 5 * 5 {
            return Err(LzmaError::BadProperties);
        }
        Self::new(b % 9, (b / 9) % 5, b / 45)
    }

    pub fn to_byte(self) -> u8 {
        (self.pb * 5 + self.lp) * 9 + self.lc
    }

    pub fn lc(self) -> u8 {
        self.lc
    }

    pub fn lp(self) -> u8 {
        self.lp
    }

    pub fn pb(self) -> u8 {
        self.pb
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Header {
    pub props: Props,
    pub dict_size: u32,
    pub uncompressed_size: u64,
}

impl Header {
    pub fn parse(bytes: &[u8]) -> Result<Self, LzmaError> {
        let bytes: &[u8; HEADER_LEN] = bytes
            .get(..HEADER_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(LzmaError::BadHeader)?;
        let props = Props::from_byte(bytes[0])?;
        let mut dict = [0; 4];
        dict.copy_from_slice(&bytes[1..5]);
        let mut size = [0; 8];
        size.copy_from_slice(&bytes[5..13]);
        Ok(Header {
            props,
            dict_size: u32::from_le_bytes(dict),
            uncompressed_size: u64::from_le_bytes(size),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0; HEADER_LEN];
        out[0] = self.props.to_byte();
        out[1..5].copy_from_slice(&self.dict_size.to_le_bytes());
        out[5..13].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        out
    }

    /// Dictionary size as the decoder treats it.
    pub fn effective_dict_size(&self) -> u32 {
        self.dict_size.max(DICT_MIN)
    }
}

/// Returns the uncompressed length recorded in `header`.
///
/// Streams without a recorded length are refused: the boot stage has to
/// know how much it is about to write before it starts.
pub fn get_uncompress_len(header: &[u8]) -> Result<u32, LzmaError> {
    let h = Header::parse(header)?;
    if h.uncompressed_size == UNKNOWN_SIZE {
        return Err(LzmaError::BadHeader);
    }
    u32::try_from(h.uncompressed_size).map_err(|_| LzmaError::BadHeader)
}

/// Memory the decoder needs for a stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemRequirement {
    /// Number of `u16` probability slots.
    pub probs: usize,
    /// Dictionary bytes.
    pub dict: usize,
}

pub fn mem_detect(header: &[u8]) -> Result<MemRequirement, LzmaError> {
    let h = Header::parse(header)?;
    let len = get_uncompress_len(header)?;
    Ok(MemRequirement {
        probs: model::probs_len(h.props),
        dict: h.dict_size.min(len).max(DICT_MIN) as usize,
    })
}

/// Caller-provided decoder memory, sized from [`mem_detect`].
pub struct Workspace<'a> {
    pub probs: &'a mut [u16],
    pub dict: &'a mut [u8],
}

/// Random-access source of compressed bytes.
pub trait ReadAt {
    /// Reads up to `buf.len()` bytes at `offset`, returning how many were
    /// read. Zero means the end of the input.
    fn read_at(&mut self, offset: u32, buf: &mut [u8])
        -> Result<usize, LzmaError>;
}

/// Random-access sink for decompressed bytes.
pub trait WriteAt {
    /// Writes `buf` at `offset`, returning how many bytes were taken.
    fn write_at(&mut self, offset: u32, buf: &[u8]) -> Result<usize, LzmaError>;
}

impl ReadAt for &[u8] {
    fn read_at(
        &mut self,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize, LzmaError> {
        let rest = self.get(offset as usize..).unwrap_or(&[]);
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        Ok(n)
    }
}

impl WriteAt for [u8] {
    fn write_at(
        &mut self,
        offset: u32,
        buf: &[u8],
    ) -> Result<usize, LzmaError> {
        let start = offset as usize;
        let dst = self
            .get_mut(start..start + buf.len())
            .ok_or(LzmaError::OutputTooSmall)?;
        dst.copy_from_slice(buf);
        Ok(buf.len())
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &mut T {
    fn read_at(
        &mut self,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize, LzmaError> {
        (**self).read_at(offset, buf)
    }
}

impl<T: WriteAt + ?Sized> WriteAt for &mut T {
    fn write_at(
        &mut self,
        offset: u32,
        buf: &[u8],
    ) -> Result<usize, LzmaError> {
        (**self).write_at(offset, buf)
    }
}
