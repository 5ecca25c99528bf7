// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Efuse configuration files: a hashed list of `(start_bit, width, value)`
//! items to burn in one go.

use crate::{Efuse, EfuseError};
use ringbuf::{ringbuf, ringbuf_entry};
use sha2::{Digest, Sha256};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

const HASH_LEN: usize = 32;

/// At most one item per efuse word plus one per lock bit.
const MAX_ITEMS: u16 = 128;

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct ConfigHeader {
    pub hash: [u8; HASH_LEN],
    pub stru_ver: u8,
    /// Offset of the first item from the start of the file.
    pub stru_size: u8,
    pub number: U16,
    pub file_size: U32,
    pub reserved: [U32; 2],
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct ConfigItem {
    pub stru_ver: u8,
    /// Offset of the value from the start of this item.
    pub stru_size: u8,
    pub start_bit: U16,
    pub bit_width: U16,
    pub value_len: U16,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Rejected(EfuseError),
    ItemFailed {
        index: u16,
        start_bit: u16,
        bit_width: u16,
        err: EfuseError,
    },
    Burned {
        items: u16,
    },
}

ringbuf!(Trace, 16, Trace::None);

fn verify(file: &[u8]) -> Result<ConfigHeader, EfuseError> {
    let (header, _) = ConfigHeader::read_from_prefix(file)
        .map_err(|_| EfuseError::BadConfigFormat)?;
    if header.file_size.get() as usize != file.len()
        || usize::from(header.stru_size) < core::mem::size_of::<ConfigHeader>()
    {
        return Err(EfuseError::BadConfigFormat);
    }
    let digest = Sha256::digest(&file[HASH_LEN..]);
    if digest.as_slice() != &header.hash[..] {
        return Err(EfuseError::BadConfigHash);
    }
    if header.number.get() > MAX_ITEMS {
        return Err(EfuseError::BadConfigFormat);
    }
    Ok(header)
}

/// Burns every item of a configuration file.
///
/// The file is rejected as a whole if its length or hash is wrong. After
/// that, a failing item does not stop the ones behind it; the first item
/// error is returned once all items have been tried.
pub fn burn_config(
    efuse: &mut impl Efuse,
    file: &[u8],
) -> Result<(), EfuseError> {
    let header = verify(file).inspect_err(|&e| {
        ringbuf_entry!(Trace::Rejected(e));
    })?;

    let mut first_err = None;
    let mut pos = usize::from(header.stru_size);
    for index in 0..header.number.get() {
        let item = file
            .get(pos..)
            .and_then(|rest| ConfigItem::read_from_prefix(rest).ok())
            .map(|(item, _)| item);
        let Some(item) = item else {
            // Can't find the next item without this one's lengths.
            first_err.get_or_insert(EfuseError::BadConfigFormat);
            break;
        };
        let value_start = pos + usize::from(item.stru_size);
        let value_end = value_start + usize::from(item.value_len.get());

        let result = match file.get(value_start..value_end) {
            Some(value) => efuse.burn_bits(
                item.start_bit.get(),
                item.bit_width.get(),
                value,
            ),
            None => Err(EfuseError::BadConfigFormat),
        };
        if let Err(err) = result {
            ringbuf_entry!(Trace::ItemFailed {
                index,
                start_bit: item.start_bit.get(),
                bit_width: item.bit_width.get(),
                err,
            });
            first_err.get_or_insert(err);
        }
        pos = value_end;
    }

    ringbuf_entry!(Trace::Burned {
        items: header.number.get()
    });
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimEfuse;

    fn build(items: &[(u16, u16, &[u8])]) -> Vec<u8> {
        let mut body = vec![];
        for &(start_bit, bit_width, value) in items {
            let item = ConfigItem {
                stru_ver: 0,
                stru_size: core::mem::size_of::<ConfigItem>() as u8,
                start_bit: start_bit.into(),
                bit_width: bit_width.into(),
                value_len: (value.len() as u16).into(),
            };
            body.extend_from_slice(item.as_bytes());
            body.extend_from_slice(value);
        }
        let hlen = core::mem::size_of::<ConfigHeader>();
        let mut header = ConfigHeader {
            hash: [0; HASH_LEN],
            stru_ver: 0,
            stru_size: hlen as u8,
            number: (items.len() as u16).into(),
            file_size: ((hlen + body.len()) as u32).into(),
            reserved: [U32::new(0); 2],
        };
        let mut file = header.as_bytes().to_vec();
        file.extend_from_slice(&body);
        header.hash = Sha256::digest(&file[HASH_LEN..]).into();
        file[..HASH_LEN].copy_from_slice(&header.hash);
        file
    }

    #[test]
    fn header_is_48_bytes() {
        assert_eq!(core::mem::size_of::<ConfigHeader>(), 48);
        assert_eq!(core::mem::size_of::<ConfigItem>(), 8);
    }

    #[test]
    fn burns_all_items() {
        let file =
            build(&[(0, 8, &[0x5a, 0, 0, 0]), (100, 4, &[0x9, 0, 0, 0])]);
        let mut e = SimEfuse::new();
        burn_config(&mut e, &file).unwrap();

        let mut v = [0u8];
        e.read_bits(0, 8, &mut v).unwrap();
        assert_eq!(v, [0x5a]);
        e.read_bits(100, 4, &mut v).unwrap();
        assert_eq!(v, [0x9]);
    }

    #[test]
    fn bad_hash_burns_nothing() {
        let mut file = build(&[(0, 8, &[0xff, 0, 0, 0])]);
        let last = file.len() - 1;
        file[last] ^= 1;
        let mut e = SimEfuse::new();
        assert_eq!(burn_config(&mut e, &file), Err(EfuseError::BadConfigHash));
        assert!(e.raw().iter().all(|&b| b == 0));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let file = build(&[(0, 8, &[0xff, 0, 0, 0])]);
        let mut e = SimEfuse::new();
        assert_eq!(
            burn_config(&mut e, &file[..file.len() - 1]),
            Err(EfuseError::BadConfigFormat)
        );
    }

    #[test]
    fn failing_item_does_not_stop_the_rest() {
        let file = build(&[
            (32, 8, &[0xff, 0, 0, 0]),
            (64, 8, &[0x3c, 0, 0, 0]),
        ]);
        let mut e = SimEfuse::new();
        e.lock_word(1).unwrap();
        assert_eq!(burn_config(&mut e, &file), Err(EfuseError::Locked));

        let mut v = [0u8];
        e.read_bits(32, 8, &mut v).unwrap();
        assert_eq!(v, [0]);
        e.read_bits(64, 8, &mut v).unwrap();
        assert_eq!(v, [0x3c]);
    }
}
