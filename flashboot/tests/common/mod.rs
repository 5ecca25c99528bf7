// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(dead_code)]

use drv_efuse::SimEfuse;
use drv_flash_api::{
    Flash, FlashError, Geometry, RamFlash, StatusRegister,
};
use flashboot::{Board, Resources, StartupCfg};
use lzma::Props;
use nv_store::{id, NvStore};
use partition_table::{Partition, Region, DEFAULT_TABLE, FLASH_SIZE};
use sha2::{Digest, Sha256};
use upg_image::{write_file, CommonHead, FileSpec, FileType};

pub const KERNEL_A: u32 = 0xd000;
pub const KERNEL_B: u32 = 0xf1000;
/// Where the kernel running from bank A stages files for bank B.
pub const STAGE_B: u32 = KERNEL_B + 0x8_0000;
pub const STAGE_A: u32 = KERNEL_A + 0x8_0000;

/// RAM flash with a region where writes fail, and a status register.
pub struct TestFlash<'a> {
    pub ram: RamFlash<'a>,
    pub bad: Option<Region>,
    pub status2: u8,
}

impl Flash for TestFlash<'_> {
    fn geometry(&self) -> Geometry {
        self.ram.geometry()
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.ram.read(addr, buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let hit = Region {
            base: addr,
            size: data.len() as u32,
        };
        if self.bad.is_some_and(|r| r.overlaps(&hit)) {
            return Err(FlashError::WriteFailed);
        }
        self.ram.write(addr, data)
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
        self.ram.erase(addr, len)
    }
}

impl StatusRegister for TestFlash<'_> {
    fn read_status2(&mut self) -> Result<u8, FlashError> {
        Ok(self.status2)
    }

    fn write_status2(&mut self, value: u8) -> Result<(), FlashError> {
        self.status2 = value;
        Ok(())
    }
}

pub type TestBoard<'a> = Board<'a, TestFlash<'a>, SimEfuse>;

/// Backing memory for one simulated device.
pub struct Rig {
    pub flash: Vec<u8>,
    pub probs: Vec<u16>,
    pub dict: Vec<u8>,
}

impl Rig {
    pub fn new() -> Self {
        Self {
            flash: vec![0xff; FLASH_SIZE as usize],
            probs: vec![0; 0x2000],
            dict: vec![0; 0x4000],
        }
    }

    /// The flash and memory `flashboot::start` is handed at power-on.
    pub fn parts(&mut self) -> (TestFlash<'_>, Resources<'_>) {
        let Rig { flash, probs, dict } = self;
        let flash = TestFlash {
            ram: RamFlash::new(0, flash),
            bad: None,
            status2: 0,
        };
        let res = Resources {
            probs,
            dict,
            #[cfg(feature = "flash-encrypt")]
            crypto: None,
        };
        (flash, res)
    }

    pub fn board(&mut self) -> TestBoard<'_> {
        let Rig { flash, probs, dict } = self;
        let res = Resources {
            probs,
            dict,
            #[cfg(feature = "flash-encrypt")]
            crypto: None,
        };
        board_over(flash, res)
    }

    #[cfg(feature = "flash-encrypt")]
    pub fn board_with<'a>(
        &'a mut self,
        crypto: flashboot::Crypto<'a>,
    ) -> TestBoard<'a> {
        let Rig { flash, probs, dict } = self;
        let res = Resources {
            probs,
            dict,
            crypto: Some(crypto),
        };
        board_over(flash, res)
    }
}

fn board_over<'a>(flash: &'a mut [u8], res: Resources<'a>) -> TestBoard<'a> {
    let mut flash = TestFlash {
        ram: RamFlash::new(0, flash),
        bad: None,
        status2: 0,
    };
    let fnv = DEFAULT_TABLE.get(Partition::FactoryNv);
    let nv = NvStore::mount(&mut flash, fnv.base, fnv.size).unwrap();
    Board::new(flash, SimEfuse::new(), nv, DEFAULT_TABLE, res)
}

/// Kernel-like contents, different for each `seed`.
pub fn image(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i % 251) as u8 ^ (i / 512) as u8 ^ seed)
        .collect()
}

pub fn compressed(data: &[u8]) -> Vec<u8> {
    let mut out = vec![];
    lzma::compress(data, Props::DEFAULT, |b: &[u8]| {
        out.extend_from_slice(b);
        Ok::<(), ()>(())
    })
    .unwrap();
    out
}

pub fn plain_file(data: &[u8], version: u8) -> FileSpec {
    FileSpec {
        file_type: FileType::Code,
        file_version: version,
        encrypted: false,
        compressed: false,
        section0_len: data.len() as u32,
        section0_hash: Sha256::digest(data).into(),
    }
}

/// Stages a file at `addr` and asks the next boot to install it, the way a
/// kernel would after receiving it.
pub fn stage(
    board: &mut TestBoard<'_>,
    addr: u32,
    file: &FileSpec,
    section0: &[u8],
    section1: Option<&[u8]>,
) -> CommonHead {
    let head =
        write_file(&mut board.flash, addr, file, section0, section1).unwrap();
    flashboot::request_upgrade(
        &mut board.nv,
        &mut board.flash,
        addr,
        head.file_len.get(),
        file.file_type,
    )
    .unwrap();
    head
}

pub fn record(board: &mut TestBoard<'_>) -> StartupCfg {
    board
        .nv
        .read_record(&mut board.flash, id::STARTUP_CFG)
        .unwrap()
}

pub fn store_record(board: &mut TestBoard<'_>, cfg: &StartupCfg) {
    flashboot::save_cfg(&mut board.nv, &mut board.flash, cfg).unwrap();
}

pub fn bank<'b>(board: &'b TestBoard<'_>, addr: u32, len: usize) -> &'b [u8] {
    &board.flash.ram.contents()[addr as usize..][..len]
}
