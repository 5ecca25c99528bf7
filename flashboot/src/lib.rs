// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash boot stage.
//!
//! Runs once per power-on, after the ROM and loader stages. It reads the
//! startup record from factory NV, decides which kernel bank to run
//! (installing a staged upgrade file first if one was requested), persists
//! the record and jumps.
//!
//! The decision is made by [`run_cycle`], which touches nothing but the
//! [`Board`] it is given. [`start`] and [`execute_upg_boot`] wrap it with
//! the parts that cannot return: reporting through the debug channel,
//! resetting the chip, and transferring control.
//!
//! A kernel bank is booted in trial mode after an install: the restart
//! counter in the startup record stays above zero and grows on every boot
//! until the kernel calls [`confirm_boot`]. Once it passes `cnt_max` the
//! other bank is booted instead.

#![cfg_attr(not(test), no_std)]

use drv_efuse::{BitSet, Efuse, EfuseError, EfuseField, KERNEL_VER_BITS};
use drv_flash_api::{set_quad_enable, Flash, FlashError, StatusRegister};
use lzma::LzmaError;
use nv_store::{NvError, NvStore};
use partition_table::{
    Partition, PartitionTable, TableError, DEFAULT_TABLE,
};
use ringbuf::{ringbuf, ringbuf_entry};
use upg_image::{UpgError, KERNEL_VER_MAX};

mod cfg;
mod handoff;
mod upg;
mod writeback;

cfg_if::cfg_if! {
    if #[cfg(feature = "flash-encrypt")] {
        mod crypt;
        pub use crypt::Crypto;
        pub use flash_crypt::CryptError;
    }
}

pub use cfg::{
    confirm_boot, load_cfg, request_upgrade, save_cfg, FactoryMode, Mode,
    StartupCfg, CNT_MAX_DEFAULT, REFRESH_NV_MAGIC,
};
pub use handoff::{
    BootHandoff, BootState, HandoffError, Slot, UpgradeOutcome,
    HANDOFF_MAGIC, HANDOFF_SIZE, HANDOFF_VERSION,
};
pub use upg::run_cycle;

/// How long the debug output gets to drain before a reset.
pub const RESET_DELAY_MS: u32 = 5;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootError {
    Flash(FlashError),
    Nv(NvError),
    Table(TableError),
    Efuse(EfuseError),
    Upg(UpgError),
    Lzma(LzmaError),
    #[cfg(feature = "flash-encrypt")]
    Crypt(CryptError),
    /// The file is encrypted and no cipher is available for its bank.
    NoCipher,
    /// The file would be written over the bank that is running.
    RunningBank,
}

impl From<FlashError> for BootError {
    fn from(e: FlashError) -> Self {
        BootError::Flash(e)
    }
}

impl From<NvError> for BootError {
    fn from(e: NvError) -> Self {
        BootError::Nv(e)
    }
}

impl From<TableError> for BootError {
    fn from(e: TableError) -> Self {
        BootError::Table(e)
    }
}

impl From<EfuseError> for BootError {
    fn from(e: EfuseError) -> Self {
        BootError::Efuse(e)
    }
}

impl From<UpgError> for BootError {
    fn from(e: UpgError) -> Self {
        BootError::Upg(e)
    }
}

impl From<LzmaError> for BootError {
    fn from(e: LzmaError) -> Self {
        BootError::Lzma(e)
    }
}

#[cfg(feature = "flash-encrypt")]
impl From<CryptError> for BootError {
    fn from(e: CryptError) -> Self {
        BootError::Crypt(e)
    }
}

/// Memory lent to the boot stage for the length of one cycle.
pub struct Resources<'a> {
    /// LZMA probability model; see `lzma::mem_detect`.
    pub probs: &'a mut [u16],
    /// LZMA dictionary window.
    pub dict: &'a mut [u8],
    /// `None` rejects every encrypted file.
    #[cfg(feature = "flash-encrypt")]
    pub crypto: Option<Crypto<'a>>,
}

/// Everything one boot cycle works on.
pub struct Board<'a, F: Flash, E: Efuse> {
    pub flash: F,
    pub efuse: E,
    /// The mounted factory NV area.
    pub nv: NvStore,
    pub table: PartitionTable,
    pub res: Resources<'a>,
}

impl<'a, F: Flash, E: Efuse> Board<'a, F, E> {
    pub fn new(
        flash: F,
        efuse: E,
        nv: NvStore,
        table: PartitionTable,
        res: Resources<'a>,
    ) -> Self {
        Self {
            flash,
            efuse,
            nv,
            table,
            res,
        }
    }
}

/// The parts of the chip the boot stage drives but does not model.
pub trait Platform {
    /// Writes a line to the low-level debug UART.
    fn debug_msg(&mut self, msg: &str);

    fn delay_ms(&mut self, ms: u32);

    /// RAM shared with the kernel for the [`BootHandoff`].
    fn handoff_area(&mut self) -> &mut [u8];

    /// Transfers control to the kernel image at `addr`.
    fn jump(&mut self, addr: u32) -> !;

    /// Global hardware reset.
    fn reset(&mut self) -> !;
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    QuadEnable(Result<(), FlashError>),
    FactoryNv(Result<(), NvError>),
    Table(Result<(), TableError>),
    Handoff(HandoffError),
    Jump(u32),
    Fatal(BootError),
    VersionCommitted(u8),
}

ringbuf!(Trace, 8, Trace::None);

fn fatal(platform: &mut impl Platform, msg: &str) -> ! {
    platform.debug_msg(msg);
    platform.delay_ms(RESET_DELAY_MS);
    platform.reset()
}

/// Power-on entry: brings up flash and the factory NV area, loads the
/// partition table and hands over to [`execute_upg_boot`].
pub fn start<F, E>(
    platform: &mut impl Platform,
    mut flash: F,
    efuse: E,
    res: Resources<'_>,
) -> !
where
    F: Flash + StatusRegister,
    E: Efuse,
{
    let r = set_quad_enable(&mut flash);
    ringbuf_entry!(Trace::QuadEnable(r));
    if r.is_err() {
        // Single-lane reads still work.
        platform.debug_msg("flash err");
    }

    let fnv = DEFAULT_TABLE.get(Partition::FactoryNv);
    let nv = match NvStore::mount(&mut flash, fnv.base, fnv.size) {
        Ok(nv) => {
            ringbuf_entry!(Trace::FactoryNv(Ok(())));
            nv
        }
        Err(e) => {
            ringbuf_entry!(Trace::FactoryNv(Err(e)));
            fatal(platform, "fnv err")
        }
    };

    let (table, r) = PartitionTable::load(&mut flash, &nv);
    ringbuf_entry!(Trace::Table(r));
    if r.is_err() {
        platform.debug_msg("parti err");
    }

    let mut board = Board::new(flash, efuse, nv, table, res);
    execute_upg_boot(&mut board, platform)
}

/// Runs one boot cycle and transfers control to the chosen image.
///
/// If the cycle fails, the failure is reported and the chip is reset.
pub fn execute_upg_boot<F: Flash, E: Efuse>(
    board: &mut Board<'_, F, E>,
    platform: &mut impl Platform,
) -> ! {
    match run_cycle(board) {
        Ok(handoff) => {
            if let Err(e) = handoff.store(platform.handoff_area()) {
                ringbuf_entry!(Trace::Handoff(e));
                platform.debug_msg("handoff err");
            }
            ringbuf_entry!(Trace::Jump(handoff.addr));
            platform.jump(handoff.addr)
        }
        Err(e) => {
            ringbuf_entry!(Trace::Fatal(e));
            fatal(platform, "upg boot err")
        }
    }
}

/// Kernel side: raises the anti-rollback version burned into efuse to
/// `version`, so that older files are refused from then on.
///
/// The field is a thermometer code, so this only ever burns more bits. A
/// version at or below the current one is a no-op.
pub fn commit_version(
    efuse: &mut impl Efuse,
    version: u8,
) -> Result<(), BootError> {
    if version > KERNEL_VER_MAX {
        return Err(UpgError::VersionTooNew.into());
    }
    let mut bits = BitSet::new([0u8; KERNEL_VER_BITS as usize / 8]);
    for pos in 0..usize::from(version) {
        bits.set(pos, true)?;
    }
    let (start, width) = EfuseField::KernelVersion.location();
    efuse.burn_bits(start, width, bits.as_bytes())?;
    ringbuf_entry!(Trace::VersionCommitted(version));
    Ok(())
}
