// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Writing a validated upgrade file into its kernel bank.

use crate::BootError;
use core::cell::RefCell;
use drv_flash_api::{copy_range, erase_range, sector_align_up, Flash};
use lzma::{
    get_uncompress_len, mem_detect, LzmaError, ReadAt, WriteAt, Workspace,
    HEADER_LEN,
};
use partition_table::Region;
use ringbuf::{ringbuf, ringbuf_entry};
use upg_image::{hash_one_content, UpgError, HASH_LEN};

/// Section 0 of a staged file, as it is stored.
pub(crate) trait Payload {
    /// Reads plaintext at `offset` into the `len` stored bytes at `addr`,
    /// returning how many bytes were read (short only at the end).
    fn read_at(
        &mut self,
        flash: &mut impl Flash,
        addr: u32,
        len: u32,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize, BootError>;

    /// Writes the plaintext of the `len` stored bytes at `src` to the
    /// erased flash at `dst`.
    fn copy(
        &mut self,
        flash: &mut impl Flash,
        src: u32,
        dst: u32,
        len: u32,
    ) -> Result<(), BootError>;
}

/// Section 0 stored as is.
pub(crate) struct Plain;

impl Payload for Plain {
    fn read_at(
        &mut self,
        flash: &mut impl Flash,
        addr: u32,
        len: u32,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize, BootError> {
        if offset >= len {
            return Ok(0);
        }
        let n = buf.len().min((len - offset) as usize);
        flash.read(addr + offset, &mut buf[..n])?;
        Ok(n)
    }

    fn copy(
        &mut self,
        flash: &mut impl Flash,
        src: u32,
        dst: u32,
        len: u32,
    ) -> Result<(), BootError> {
        copy_range(flash, src, dst, len)?;
        Ok(())
    }
}

/// Section 1 of a code-and-NV file.
#[derive(Copy, Clone, Debug)]
pub(crate) struct NvImage {
    pub src: u32,
    pub len: u32,
    pub dst: Region,
}

/// Everything write-back needs to know, taken from a validated file.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Job {
    /// Section 0 in the staged file.
    pub src: u32,
    pub stored: u32,
    /// The kernel bank; section 0 goes to its base.
    pub dst: Region,
    /// Length of section 0 once written.
    pub len: u32,
    pub compressed: bool,
    pub hash: [u8; HASH_LEN],
    pub nv: Option<NvImage>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Start { dst: u32, len: u32, compressed: bool },
    InputFailed(BootError),
    OutputFailed(BootError),
    Decompressed(u32),
    Verified,
    Nv { dst: u32, len: u32 },
}

ringbuf!(Trace, 8, Trace::None);

fn read_header(
    flash: &mut impl Flash,
    payload: &mut impl Payload,
    job: &Job,
) -> Result<[u8; HEADER_LEN], BootError> {
    let mut header = [0; HEADER_LEN];
    let n = payload.read_at(flash, job.src, job.stored, 0, &mut header)?;
    if n != HEADER_LEN {
        return Err(LzmaError::BadHeader.into());
    }
    Ok(header)
}

/// Checks, before anything is erased, that a compressed section 0 declares
/// its real length and fits in `probs` and `dict`.
pub(crate) fn check_stream(
    flash: &mut impl Flash,
    payload: &mut impl Payload,
    job: &Job,
    probs: usize,
    dict: usize,
) -> Result<(), BootError> {
    let header = read_header(flash, payload, job)?;
    let need = mem_detect(&header)?;
    if need.probs > probs || need.dict > dict {
        return Err(LzmaError::Workspace.into());
    }
    if get_uncompress_len(&header)? != job.len {
        return Err(LzmaError::SizeMismatch.into());
    }
    Ok(())
}

/// Compressed input, read through the payload from the shared flash.
struct Input<'a, 'f, F, P> {
    flash: &'a RefCell<&'f mut F>,
    payload: &'a mut P,
    job: &'a Job,
}

impl<F: Flash, P: Payload> ReadAt for Input<'_, '_, F, P> {
    fn read_at(
        &mut self,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize, LzmaError> {
        let mut flash =
            self.flash.try_borrow_mut().map_err(|_| LzmaError::Input)?;
        let offset = offset + HEADER_LEN as u32;
        self.payload
            .read_at(&mut *flash, self.job.src, self.job.stored, offset, buf)
            .map_err(|e| {
                ringbuf_entry!(Trace::InputFailed(e));
                LzmaError::Input
            })
    }
}

/// Decompressed output, programmed into the erased start of the bank.
struct Output<'a, 'f, F> {
    flash: &'a RefCell<&'f mut F>,
    base: u32,
    limit: u32,
}

impl<F: Flash> WriteAt for Output<'_, '_, F> {
    fn write_at(
        &mut self,
        offset: u32,
        buf: &[u8],
    ) -> Result<usize, LzmaError> {
        let fits = offset
            .checked_add(buf.len() as u32)
            .is_some_and(|end| end <= self.limit);
        if !fits {
            return Err(LzmaError::OutputTooSmall);
        }
        let mut flash =
            self.flash.try_borrow_mut().map_err(|_| LzmaError::Output)?;
        flash.write(self.base + offset, buf).map_err(|e| {
            ringbuf_entry!(Trace::OutputFailed(e.into()));
            LzmaError::Output
        })?;
        Ok(buf.len())
    }
}

/// Erases the start of the bank, writes section 0 there (decompressing it
/// on the way if needed), checks the result against the section hash, and
/// then installs the NV image if there is one.
///
/// Any error leaves the bank in an unknown state; it must not be booted.
pub(crate) fn write_back<F: Flash>(
    flash: &mut F,
    mem: Workspace<'_>,
    payload: &mut impl Payload,
    job: &Job,
) -> Result<(), BootError> {
    ringbuf_entry!(Trace::Start {
        dst: job.dst.base,
        len: job.len,
        compressed: job.compressed,
    });
    erase_range(flash, job.dst.base, job.len)?;

    if job.compressed {
        let header = read_header(flash, payload, job)?;
        let shared = RefCell::new(&mut *flash);
        let mut input = Input {
            flash: &shared,
            payload,
            job,
        };
        let mut output = Output {
            flash: &shared,
            base: job.dst.base,
            limit: sector_align_up(job.len),
        };
        let n = lzma::decompress(&header, mem, &mut input, &mut output)?;
        ringbuf_entry!(Trace::Decompressed(n));
        if n != job.len {
            return Err(LzmaError::SizeMismatch.into());
        }
    } else {
        payload.copy(flash, job.src, job.dst.base, job.stored)?;
    }

    if hash_one_content(flash, job.dst.base, job.len)? != job.hash {
        return Err(UpgError::HashMismatch.into());
    }
    ringbuf_entry!(Trace::Verified);

    if let Some(nv) = job.nv {
        ringbuf_entry!(Trace::Nv {
            dst: nv.dst.base,
            len: nv.len,
        });
        erase_range(flash, nv.dst.base, nv.dst.size)?;
        copy_range(flash, nv.src, nv.dst.base, nv.len)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_flash_api::RamFlash;
    use lzma::Props;
    use sha2::{Digest, Sha256};

    const SRC: u32 = 0x8000;
    const BANK: Region = Region {
        base: 0x1000,
        size: 0x6000,
    };

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 ^ (i / 512) as u8).collect()
    }

    fn job(len: usize, stored: usize, compressed: bool) -> Job {
        Job {
            src: SRC,
            stored: stored as u32,
            dst: BANK,
            len: len as u32,
            compressed,
            hash: Sha256::digest(image(len)).into(),
            nv: None,
        }
    }

    struct Mem {
        probs: Vec<u16>,
        dict: Vec<u8>,
    }

    impl Mem {
        fn new() -> Self {
            Self {
                probs: vec![0; 0x2000],
                dict: vec![0; 0x4000],
            }
        }

        fn ws(&mut self) -> Workspace<'_> {
            Workspace {
                probs: &mut self.probs,
                dict: &mut self.dict,
            }
        }
    }

    fn compressed(data: &[u8]) -> Vec<u8> {
        let mut out = vec![];
        lzma::compress(data, Props::DEFAULT, |b: &[u8]| {
            out.extend_from_slice(b);
            Ok::<(), ()>(())
        })
        .unwrap();
        out
    }

    #[test]
    fn plain_copy() {
        let mut mem = vec![0xff; 0x10000];
        let data = image(0x1234);
        mem[SRC as usize..][..data.len()].copy_from_slice(&data);
        let mut flash = RamFlash::new(0, &mut mem);
        let mut m = Mem::new();

        let j = job(data.len(), data.len(), false);
        write_back(&mut flash, m.ws(), &mut Plain, &j).unwrap();
        assert_eq!(&flash.contents()[0x1000..][..data.len()], &data[..]);
    }

    #[test]
    fn stream_is_checked_before_anything_is_erased() {
        let mut mem = vec![0xff; 0x10000];
        let data = image(0x3000);
        let packed = compressed(&data);
        mem[SRC as usize..][..packed.len()].copy_from_slice(&packed);
        let mut flash = RamFlash::new(0, &mut mem);

        let j = job(data.len(), packed.len(), true);
        check_stream(&mut flash, &mut Plain, &j, 0x2000, 0x4000).unwrap();
        assert_eq!(
            check_stream(&mut flash, &mut Plain, &j, 0x2000, 0x100),
            Err(BootError::Lzma(LzmaError::Workspace))
        );
        let mut wrong = j;
        wrong.len += 1;
        assert_eq!(
            check_stream(&mut flash, &mut Plain, &wrong, 0x2000, 0x4000),
            Err(BootError::Lzma(LzmaError::SizeMismatch))
        );
        let mut short = j;
        short.stored = 5;
        assert_eq!(
            check_stream(&mut flash, &mut Plain, &short, 0x2000, 0x4000),
            Err(BootError::Lzma(LzmaError::BadHeader))
        );
        assert_eq!(flash.erase_count(), 0);
    }

    #[test]
    fn decompresses_into_the_bank() {
        let mut mem = vec![0xff; 0x10000];
        let data = image(0x3000);
        let packed = compressed(&data);
        mem[SRC as usize..][..packed.len()].copy_from_slice(&packed);
        let mut flash = RamFlash::new(0, &mut mem);
        let mut m = Mem::new();

        let j = job(data.len(), packed.len(), true);
        write_back(&mut flash, m.ws(), &mut Plain, &j).unwrap();
        assert_eq!(&flash.contents()[0x1000..][..data.len()], &data[..]);
    }

    #[test]
    fn wrong_hash_is_a_verify_failure() {
        let mut mem = vec![0xff; 0x10000];
        let mut flash = RamFlash::new(0, &mut mem);
        let mut m = Mem::new();
        let mut j = job(0x100, 0x100, false);
        j.hash[0] ^= 1;
        assert_eq!(
            write_back(&mut flash, m.ws(), &mut Plain, &j),
            Err(BootError::Upg(UpgError::HashMismatch))
        );
    }

    #[test]
    fn nv_image_follows_the_kernel() {
        let mut mem = vec![0xff; 0x10000];
        let data = image(0x200);
        mem[SRC as usize..][..data.len()].copy_from_slice(&data);
        mem[0xa000..0xa010].fill(0);
        mem[0x9000..0x9040].fill(0x3c);
        let mut flash = RamFlash::new(0, &mut mem);
        let mut m = Mem::new();

        let mut j = job(data.len(), data.len(), false);
        j.nv = Some(NvImage {
            src: 0x9000,
            len: 0x40,
            dst: Region {
                base: 0xa000,
                size: 0x2000,
            },
        });
        write_back(&mut flash, m.ws(), &mut Plain, &j).unwrap();
        let c = flash.contents();
        assert_eq!(&c[0xa000..0xa040], &[0x3c; 0x40]);
        assert!(c[0xa040..0xc000].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn failed_write_is_reported() {
        let mut mem = vec![0xff; 0x10000];
        let data = image(0x3000);
        let packed = compressed(&data);
        mem[SRC as usize..][..packed.len()].copy_from_slice(&packed);
        let mut flash = RamFlash::new(0, &mut mem);
        let mut m = Mem::new();
        flash.fail_after_writes(0);

        let j = job(data.len(), packed.len(), true);
        assert_eq!(
            write_back(&mut flash, m.ws(), &mut Plain, &j),
            Err(BootError::Lzma(LzmaError::Output))
        );
    }
}
