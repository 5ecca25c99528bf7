// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The records in the factory NV store that steer the boot stage.
//!
//! [`StartupCfg`] is read once per boot and written back whenever the boot
//! decision changes it. The kernel edits it too, through
//! [`request_upgrade`] and [`confirm_boot`]. [`FactoryMode`] is written on
//! the production line and only ever read here.

use core::mem::size_of;
use drv_flash_api::Flash;
use nv_store::{id, NvError, NvStore};
use partition_table::{Partition, PartitionTable};
use ringbuf::{ringbuf, ringbuf_entry};
use static_assertions::const_assert_eq;
use upg_image::FileType;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// `refresh_nv` value that asks for the normal NV area to be wiped.
pub const REFRESH_NV_MAGIC: u8 = 0x55;
pub const CNT_MAX_DEFAULT: u8 = 3;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum Mode {
    Normal = 0,
    Upgrade = 1,
}

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
)]
#[repr(C)]
pub struct StartupCfg {
    /// Base of the kernel bank to boot.
    pub addr_start: u32,
    pub mode: u16,
    /// [`FileType`] the kernel staged, or 0 if it did not say.
    pub file_type: u8,
    pub refresh_nv: u8,
    /// Boots since the last upgrade attempt or install that the kernel has
    /// not yet confirmed.
    pub reset_cnt: u8,
    pub cnt_max: u8,
    pub reserved1: u16,
    /// Where the kernel staged the upgrade file.
    pub addr_write: u32,
    pub reserved2: u32,
    /// Length of the staged file, or 0 if the kernel did not say.
    pub file_len: u32,
}

const_assert_eq!(size_of::<StartupCfg>(), 24);

impl StartupCfg {
    /// The record a board starts life with.
    pub fn default_for(table: &PartitionTable) -> Self {
        Self {
            addr_start: table.get(Partition::KernelA).base,
            mode: Mode::Upgrade as u16,
            file_type: 0,
            refresh_nv: 0,
            reset_cnt: 0,
            cnt_max: CNT_MAX_DEFAULT,
            reserved1: 0,
            addr_write: 0,
            reserved2: 0,
            file_len: 0,
        }
    }

    /// Anything but the upgrade value reads as normal.
    pub fn mode(&self) -> Mode {
        if self.mode == Mode::Upgrade as u16 {
            Mode::Upgrade
        } else {
            Mode::Normal
        }
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode as u16;
    }

    pub fn wants_refresh(&self) -> bool {
        self.refresh_nv == REFRESH_NV_MAGIC
    }
}

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
)]
#[repr(C)]
pub struct FactoryMode {
    /// 1 to boot the factory test image.
    pub factory_mode: u32,
    pub factory_addr_start: u32,
    pub factory_size: u32,
    /// 1 once the factory image has been programmed.
    pub factory_valid: u32,
}

impl FactoryMode {
    /// Entry point of the factory image, if this record asks for it and
    /// the image lies inside the factory partition.
    pub fn image(&self, table: &PartitionTable) -> Option<u32> {
        let region = table.get(Partition::Factory);
        let (addr, size) = (self.factory_addr_start, self.factory_size);
        let wanted = self.factory_mode == 1 && self.factory_valid == 1;
        (wanted && size != 0 && region.contains_range(addr, size))
            .then_some(addr)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Loaded { addr_start: u32, mode: u16, reset_cnt: u8 },
    Defaulted(Option<NvError>),
    Saved { addr_start: u32, mode: u16, reset_cnt: u8 },
    UpgradeRequested { addr_write: u32 },
    Confirmed { reset_cnt: u8 },
}

ringbuf!(Trace, 8, Trace::None);

/// Reads the startup record.
///
/// A missing or unreadable record, or one whose `addr_start` is not the base
/// of a kernel bank, is replaced with [`StartupCfg::default_for`], which is
/// written back before it is returned. A `cnt_max` of `u8::MAX` can never
/// be exceeded, so it is replaced with [`CNT_MAX_DEFAULT`] and written back.
pub fn load_cfg(
    nv: &mut NvStore,
    flash: &mut impl Flash,
    table: &PartitionTable,
) -> Result<StartupCfg, NvError> {
    let err = match nv.read_record::<StartupCfg>(flash, id::STARTUP_CFG) {
        Ok(mut cfg) if table.is_kernel_base(cfg.addr_start) => {
            if cfg.cnt_max == u8::MAX {
                cfg.cnt_max = CNT_MAX_DEFAULT;
                save_cfg(nv, flash, &cfg)?;
            }
            ringbuf_entry!(Trace::Loaded {
                addr_start: cfg.addr_start,
                mode: cfg.mode,
                reset_cnt: cfg.reset_cnt,
            });
            return Ok(cfg);
        }
        Ok(_) => None,
        Err(e) => Some(e),
    };
    ringbuf_entry!(Trace::Defaulted(err));
    let cfg = StartupCfg::default_for(table);
    save_cfg(nv, flash, &cfg)?;
    Ok(cfg)
}

pub fn save_cfg(
    nv: &mut NvStore,
    flash: &mut impl Flash,
    cfg: &StartupCfg,
) -> Result<(), NvError> {
    nv.write_record(flash, id::STARTUP_CFG, cfg)?;
    ringbuf_entry!(Trace::Saved {
        addr_start: cfg.addr_start,
        mode: cfg.mode,
        reset_cnt: cfg.reset_cnt,
    });
    Ok(())
}

/// Writes `cfg` if it differs from what was last written, which is kept in
/// `saved`.
pub(crate) fn persist(
    nv: &mut NvStore,
    flash: &mut impl Flash,
    cfg: &StartupCfg,
    saved: &mut StartupCfg,
) -> Result<(), NvError> {
    if cfg != saved {
        save_cfg(nv, flash, cfg)?;
        *saved = *cfg;
    }
    Ok(())
}

/// Kernel side: marks the running image as good, ending its trial boots.
pub fn confirm_boot(
    nv: &mut NvStore,
    flash: &mut impl Flash,
) -> Result<(), NvError> {
    let mut cfg = nv.read_record::<StartupCfg>(flash, id::STARTUP_CFG)?;
    ringbuf_entry!(Trace::Confirmed {
        reset_cnt: cfg.reset_cnt
    });
    if cfg.reset_cnt != 0 {
        cfg.reset_cnt = 0;
        save_cfg(nv, flash, &cfg)?;
    }
    Ok(())
}

/// Kernel side: asks the next boot to install the file staged at
/// `addr_write`.
pub fn request_upgrade(
    nv: &mut NvStore,
    flash: &mut impl Flash,
    addr_write: u32,
    file_len: u32,
    file_type: FileType,
) -> Result<(), NvError> {
    let mut cfg = nv.read_record::<StartupCfg>(flash, id::STARTUP_CFG)?;
    cfg.set_mode(Mode::Upgrade);
    cfg.addr_write = addr_write;
    cfg.file_len = file_len;
    cfg.file_type = file_type as u8;
    cfg.reset_cnt = 0;
    ringbuf_entry!(Trace::UpgradeRequested { addr_write });
    save_cfg(nv, flash, &cfg)
}
