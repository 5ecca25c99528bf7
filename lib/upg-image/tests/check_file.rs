// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use drv_flash_api::{Flash, FlashError, Geometry, RamFlash};
use proptest::prelude::*;
use sha2::{Digest, Sha256};
use upg_image::*;
use zerocopy::IntoBytes;

const STAGE: u32 = 0x4000;
const FLASH_LEN: usize = 0x10000;

/// Records every read so tests can tell which parts of a file were touched.
struct Tracking<F> {
    inner: F,
    reads: Vec<(u32, usize)>,
    writes: usize,
}

impl<F: Flash> Flash for Tracking<F> {
    fn geometry(&self) -> Geometry {
        self.inner.geometry()
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.reads.push((addr, buf.len()));
        self.inner.read(addr, buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        self.writes += 1;
        self.inner.write(addr, data)
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
        self.inner.erase(addr, len)
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 256) as u8).collect()
}

fn stage(
    flash: &mut impl Flash,
    body: &[u8],
    nv: Option<&[u8]>,
) -> CommonHead {
    let spec = FileSpec {
        file_type: if nv.is_some() {
            FileType::CodeAndNv
        } else {
            FileType::Code
        },
        file_version: 2,
        encrypted: false,
        compressed: false,
        section0_len: body.len() as u32,
        section0_hash: Sha256::digest(body).into(),
    };
    write_file(flash, STAGE, &spec, body, nv).unwrap()
}

#[test]
fn staged_file_validates() {
    let mut mem = vec![0xff; FLASH_LEN];
    let mut flash = RamFlash::new(0, &mut mem);
    let body = payload(0x1234);
    let common = stage(&mut flash, &body, None);

    let (c, s) = check_file(&mut flash, STAGE, 0x8000).unwrap();
    assert_eq!(c, common);
    assert_eq!(s.section0_len.get(), 0x1234);
    assert_eq!(
        hash_one_content(&mut flash, STAGE + s.section0_offset.get(), 0x1234),
        Ok(s.section0_hash)
    );
}

#[test]
fn code_and_nv_file_validates() {
    let mut mem = vec![0xff; FLASH_LEN];
    let mut flash = RamFlash::new(0, &mut mem);
    let nv = payload(0x300);
    stage(&mut flash, &payload(0x801), Some(&nv));

    let (c, s) = check_file(&mut flash, STAGE, 0x8000).unwrap();
    assert_eq!(c.section_count.get(), 2);
    assert_eq!(s.section1_offset.get() % 16, 0);
    assert_eq!(s.section1_len.get(), 0x300);
}

#[test]
fn file_larger_than_staging_area() {
    let mut mem = vec![0xff; FLASH_LEN];
    let mut flash = RamFlash::new(0, &mut mem);
    stage(&mut flash, &payload(0x2000), None);
    assert_eq!(
        check_file(&mut flash, STAGE, 0x2000),
        Err(UpgError::OutOfBounds)
    );
}

#[test]
fn corrupted_payload_is_a_hash_mismatch() {
    let mut mem = vec![0xff; FLASH_LEN];
    let mut flash = RamFlash::new(0, &mut mem);
    stage(&mut flash, &payload(0x400), None);
    // clear one bit of the payload
    flash.write(STAGE + 0x181, &[0xfe]).unwrap();
    assert_eq!(
        check_file(&mut flash, STAGE, 0x8000),
        Err(UpgError::HashMismatch)
    );
}

#[test]
fn bad_magic_reads_nothing_past_the_common_head() {
    let mut mem = vec![0xff; FLASH_LEN];
    let mut flash = RamFlash::new(0, &mut mem);
    stage(&mut flash, &payload(0x400), None);
    // Knock a bit out of the magic.
    flash.write(STAGE, &[0x1c]).unwrap();

    let mut t = Tracking {
        inner: flash,
        reads: vec![],
        writes: 0,
    };
    assert_eq!(check_file(&mut t, STAGE, 0x8000), Err(UpgError::BadMagic));
    assert_eq!(t.reads, vec![(STAGE, COMMON_HEAD_LEN as usize)]);
}

#[test]
fn erased_staging_area_is_not_a_file() {
    let mut mem = vec![0xff; FLASH_LEN];
    let mut flash = RamFlash::new(0, &mut mem);
    assert_eq!(
        check_file(&mut flash, STAGE, 0x8000),
        Err(UpgError::BadMagic)
    );
}

#[test]
fn section_offset_past_file_end_is_out_of_bounds() {
    let mut mem = vec![0xff; FLASH_LEN];
    let mut flash = RamFlash::new(0, &mut mem);
    let body = payload(0x400);
    let mut common = stage(&mut flash, &body, None);

    // Restage by hand with a section header pointing off the end of the
    // file.
    let mut section = get_section_head(&mut flash, STAGE, &common).unwrap();
    section.section0_offset.set(common.file_len.get() + 0x10);
    drv_flash_api::erase_range(&mut flash, STAGE, 0x1000).unwrap();
    flash
        .write(STAGE + COMMON_HEAD_LEN, section.as_bytes())
        .unwrap();
    flash.write(STAGE + 0x100, &body[..0x400]).unwrap();
    common.image_hash = hash_one_content(
        &mut flash,
        STAGE + COMMON_HEAD_LEN,
        common.file_len.get() - COMMON_HEAD_LEN,
    )
    .unwrap();
    flash.write(STAGE, common.as_bytes()).unwrap();

    let mut t = Tracking {
        inner: flash,
        reads: vec![],
        writes: 0,
    };
    assert_eq!(
        check_file(&mut t, STAGE, 0x8000),
        Err(UpgError::OutOfBounds)
    );
    assert_eq!(t.writes, 0);
    // Only the two headers were read.
    assert_eq!(t.reads.len(), 2);
}

#[test]
fn zero_sections_is_a_failure() {
    let mut mem = vec![0xff; FLASH_LEN];
    let mut flash = RamFlash::new(0, &mut mem);
    let mut common = stage(&mut flash, &payload(0x400), None);
    common.section_count.set(0);
    let section = get_section_head(&mut flash, STAGE, &common).unwrap();

    drv_flash_api::erase_range(&mut flash, STAGE, 0x1000).unwrap();
    flash.write(STAGE, common.as_bytes()).unwrap();
    flash
        .write(STAGE + COMMON_HEAD_LEN, section.as_bytes())
        .unwrap();
    assert_eq!(
        check_file(&mut flash, STAGE, 0x8000),
        Err(UpgError::NoSections)
    );
}

#[test]
fn hash_more_content_is_one_message() {
    let mut mem = vec![0xff; FLASH_LEN];
    let mut flash = RamFlash::new(0, &mut mem);
    let a = payload(0x150);
    let b = payload(0x90);
    flash.write(0x100, &a).unwrap();
    flash.write(0x1000, &b).unwrap();

    let mut h = Sha256::new();
    h.update(&a);
    h.update(&b);
    let want: [u8; 32] = h.finalize().into();
    assert_eq!(
        hash_more_content(&mut flash, &[(0x100, 0x150), (0x1000, 0x90)]),
        Ok(want)
    );
}

proptest! {
    #[test]
    fn validator_never_reads_past_file_len(
        s0_offset in 0u32..0x3000,
        s0_len in 0u32..0x3000,
    ) {
        let mut mem = vec![0xff; FLASH_LEN];
        let mut flash = RamFlash::new(0, &mut mem);
        let mut common = stage(&mut flash, &payload(0x800), None);
        let mut section =
            get_section_head(&mut flash, STAGE, &common).unwrap();
        section.section0_offset.set(s0_offset);
        section.section0_len.set(s0_len);

        drv_flash_api::erase_range(&mut flash, STAGE, 0x1000).unwrap();
        flash.write(STAGE + COMMON_HEAD_LEN, section.as_bytes()).unwrap();
        let file_len = common.file_len.get();
        common.image_hash = hash_one_content(
            &mut flash,
            STAGE + COMMON_HEAD_LEN,
            file_len - COMMON_HEAD_LEN,
        ).unwrap();
        flash.write(STAGE, common.as_bytes()).unwrap();

        let mut t = Tracking { inner: flash, reads: vec![], writes: 0 };
        let r = check_file(&mut t, STAGE, 0x8000);
        for &(addr, len) in &t.reads {
            prop_assert!(addr >= STAGE);
            prop_assert!(addr + len as u32 <= STAGE + file_len);
        }
        let inside = s0_len > 0
            && s0_offset >= COMMON_HEAD_LEN + SECTION_HEAD_LEN
            && s0_offset + s0_len <= file_len;
        prop_assert_eq!(r.is_ok(), inside);
    }
}
