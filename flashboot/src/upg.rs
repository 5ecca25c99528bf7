// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boot decision.
//!
//! One cycle walks the startup record through these steps, persisting it
//! whenever it changes:
//!
//! 1. A `refresh_nv` request wipes the normal NV area and resets the record
//!    to its defaults.
//! 2. A valid factory-mode record boots the factory image and ends the
//!    cycle.
//! 3. A restart counter past `cnt_max` rolls back to the other bank.
//! 4. In normal mode the current bank is booted, counting the boot if the
//!    bank is still on trial.
//! 5. In upgrade mode the staged file is checked, the counter is bumped and
//!    saved, and the file is written into its bank. A file that fails
//!    after the bank was touched sends the board back to the bank it came
//!    from.
//!
//! Either way the mode ends up normal, so a bad file is tried once per
//! request.

use crate::cfg::{load_cfg, persist, FactoryMode, Mode, StartupCfg};
use crate::handoff::{BootHandoff, BootState, Slot, UpgradeOutcome};
use crate::writeback::{
    check_stream, write_back, Job, NvImage, Payload, Plain,
};
use crate::{Board, BootError};
use drv_efuse::{kernel_version, Efuse};
use drv_flash_api::{erase_range, Flash};
use lzma::Workspace;
use nv_store::{id, NvStore};
use partition_table::{Partition, PartitionTable, Region};
use ringbuf::{ringbuf, ringbuf_entry};
use upg_image::{
    check_before_decompress, check_code_ver, check_file, get_common_head,
    FileType, UpgError, PRODUCT_UPG_FILE_IMAGE_ID,
};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Refresh,
    Factory(u32),
    Rollback { from: Partition, to: Partition, reset_cnt: u8 },
    TrialBoot { reset_cnt: u8 },
    State(BootState),
    NoImage { addr_write: u32 },
    Rejected(BootError),
    Installed { addr: u32 },
    Failed(BootError),
    Boot { addr: u32, state: BootState },
}

ringbuf!(Trace, 16, Trace::None);

/// A staged file that passed every check.
struct Plan {
    target: Partition,
    encrypted: bool,
    job: Job,
}

/// Decides what to boot, doing whatever flash work that takes, and leaves
/// the startup record persisted.
///
/// Errors are the ones the board cannot boot past: the startup record could
/// not be read or saved, or NV could not be refreshed. Problems with a
/// staged file are not errors; they show up in
/// [`BootHandoff::upgrade`].
pub fn run_cycle<F: Flash, E: Efuse>(
    board: &mut Board<'_, F, E>,
) -> Result<BootHandoff, BootError> {
    let mut saved = load_cfg(&mut board.nv, &mut board.flash, &board.table)?;
    let mut cfg = saved;
    let handoff = decide(board, &mut cfg, &mut saved)?;
    persist(&mut board.nv, &mut board.flash, &cfg, &mut saved)?;
    ringbuf_entry!(Trace::Boot {
        addr: handoff.addr,
        state: handoff.state,
    });
    Ok(handoff)
}

fn decide<F: Flash, E: Efuse>(
    board: &mut Board<'_, F, E>,
    cfg: &mut StartupCfg,
    saved: &mut StartupCfg,
) -> Result<BootHandoff, BootError> {
    let table = board.table;

    if cfg.wants_refresh() {
        ringbuf_entry!(Trace::Refresh);
        for p in [Partition::NormalNv, Partition::NormalNvBackup] {
            let r = table.get(p);
            erase_range(&mut board.flash, r.base, r.size)?;
        }
        *cfg = StartupCfg::default_for(&table);
        persist(&mut board.nv, &mut board.flash, cfg, saved)?;
    }

    let factory = board
        .nv
        .read_record::<FactoryMode>(&mut board.flash, id::FACTORY_MODE)
        .ok()
        .and_then(|f| f.image(&table));
    if let Some(addr) = factory {
        ringbuf_entry!(Trace::Factory(addr));
        return Ok(BootHandoff {
            booted: Slot::Factory,
            addr,
            state: BootState::Normal,
            reset_cnt: cfg.reset_cnt,
            upgrade: None,
        });
    }

    let running = table
        .kernel_of(cfg.addr_start)
        .unwrap_or(Partition::KernelA);
    let upgrade = cfg.mode() == Mode::Upgrade;
    let candidate = if upgrade {
        table.kernel_of(cfg.addr_write).unwrap_or(running)
    } else {
        running
    };

    if cfg.reset_cnt > cfg.cnt_max {
        let to = candidate.alternate();
        ringbuf_entry!(Trace::Rollback {
            from: candidate,
            to,
            reset_cnt: cfg.reset_cnt,
        });
        cfg.addr_start = table.get(to).base;
        cfg.reset_cnt = 0;
        cfg.set_mode(Mode::Normal);
        return Ok(handoff(
            &table,
            cfg,
            BootState::Rollback,
            Some(UpgradeOutcome::RetriesExhausted),
        ));
    }

    if !upgrade {
        if cfg.reset_cnt > 0 {
            cfg.reset_cnt = cfg.reset_cnt.saturating_add(1);
            ringbuf_entry!(Trace::TrialBoot {
                reset_cnt: cfg.reset_cnt
            });
        }
        return Ok(handoff(&table, cfg, BootState::Normal, None));
    }

    let outcome = upgrade_kernel(board, cfg, saved, running)?;
    cfg.set_mode(Mode::Normal);
    let state = match outcome {
        UpgradeOutcome::Installed
        | UpgradeOutcome::Rejected
        | UpgradeOutcome::NoImage => BootState::Normal,
        UpgradeOutcome::VerifyFailed
        | UpgradeOutcome::WriteFailed
        | UpgradeOutcome::RetriesExhausted => {
            cfg.addr_start = table.get(running).base;
            cfg.reset_cnt = 0;
            BootState::Rollback
        }
    };
    Ok(handoff(&table, cfg, state, Some(outcome)))
}

fn handoff(
    table: &PartitionTable,
    cfg: &StartupCfg,
    state: BootState,
    upgrade: Option<UpgradeOutcome>,
) -> BootHandoff {
    let booted = match table.kernel_of(cfg.addr_start) {
        Some(Partition::KernelB) => Slot::B,
        _ => Slot::A,
    };
    BootHandoff {
        booted,
        addr: cfg.addr_start,
        state,
        reset_cnt: cfg.reset_cnt,
        upgrade,
    }
}

/// True if something that claims to be an upgrade file sits at `addr`.
fn has_image(
    flash: &mut impl Flash,
    table: &PartitionTable,
    addr: u32,
) -> bool {
    table.kernel_of(addr).is_some()
        && get_common_head(flash, addr)
            .is_ok_and(|h| h.image_id.get() == PRODUCT_UPG_FILE_IMAGE_ID)
}

fn upgrade_kernel<F: Flash, E: Efuse>(
    board: &mut Board<'_, F, E>,
    cfg: &mut StartupCfg,
    saved: &mut StartupCfg,
    running: Partition,
) -> Result<UpgradeOutcome, BootError> {
    if !has_image(&mut board.flash, &board.table, cfg.addr_write) {
        ringbuf_entry!(Trace::NoImage {
            addr_write: cfg.addr_write
        });
        return Ok(UpgradeOutcome::NoImage);
    }
    ringbuf_entry!(Trace::State(BootState::UpgradePending));

    let plan = match check_upgrade(board, cfg, running) {
        Ok(plan) => plan,
        Err(e) => {
            ringbuf_entry!(Trace::Rejected(e));
            return Ok(UpgradeOutcome::Rejected);
        }
    };

    if plan.encrypted {
        return install_encrypted(board, cfg, saved, &plan);
    }
    let mem = Workspace {
        probs: &mut *board.res.probs,
        dict: &mut *board.res.dict,
    };
    install(
        &mut board.flash,
        &mut board.nv,
        mem,
        cfg,
        saved,
        &plan.job,
        &mut Plain,
    )
}

/// Validates the file at `cfg.addr_write` against the bank it is staged
/// in. Nothing is written.
fn check_upgrade<F: Flash, E: Efuse>(
    board: &mut Board<'_, F, E>,
    cfg: &StartupCfg,
    running: Partition,
) -> Result<Plan, BootError> {
    let table = board.table;
    let addr = cfg.addr_write;
    let target = table.kernel_of(addr).ok_or(UpgError::OutOfBounds)?;
    if target == running {
        return Err(BootError::RunningBank);
    }
    let bank = table.get(target);

    let (common, section) =
        check_file(&mut board.flash, addr, bank.end() - addr)?;
    let efuse_ver = kernel_version(&mut board.efuse)?;
    check_code_ver(common.file_version, efuse_ver)?;

    let file_len = common.file_len.get();
    if cfg.file_len != 0 && cfg.file_len != file_len {
        return Err(UpgError::BadLength.into());
    }
    if cfg.file_type != 0 && cfg.file_type != common.file_type {
        return Err(UpgError::BadFileType.into());
    }
    let staged = Region {
        base: addr,
        size: file_len,
    };
    check_before_decompress(bank, staged, &section)?;

    let nv = if common.file_type == FileType::CodeAndNv as u8 {
        let dst = table.get(Partition::NormalNv);
        let len = section.section1_len.get();
        if len > dst.size {
            return Err(UpgError::OutOfBounds.into());
        }
        Some(NvImage {
            src: addr + section.section1_offset.get(),
            len,
            dst,
        })
    } else {
        None
    };

    Ok(Plan {
        target,
        encrypted: common.is_encrypted(),
        job: Job {
            src: addr + section.section0_offset.get(),
            stored: section.section0_stored_len(),
            dst: bank,
            len: section.section0_len.get(),
            compressed: section.is_compressed(),
            hash: section.section0_hash,
            nv,
        },
    })
}

cfg_if::cfg_if! {
    if #[cfg(feature = "flash-encrypt")] {
        fn install_encrypted<F: Flash, E: Efuse>(
            board: &mut Board<'_, F, E>,
            cfg: &mut StartupCfg,
            saved: &mut StartupCfg,
            plan: &Plan,
        ) -> Result<UpgradeOutcome, BootError> {
            let Some(crypto) = board.res.crypto.as_mut() else {
                ringbuf_entry!(Trace::Rejected(BootError::NoCipher));
                return Ok(UpgradeOutcome::Rejected);
            };
            let mut cipher = match crypto.cipher_for(
                &mut board.nv,
                &mut board.flash,
                plan.target,
            ) {
                Ok(c) => c,
                Err(e) => {
                    ringbuf_entry!(Trace::Rejected(e));
                    return Ok(UpgradeOutcome::Rejected);
                }
            };
            let mem = Workspace {
                probs: &mut *board.res.probs,
                dict: &mut *board.res.dict,
            };
            install(
                &mut board.flash,
                &mut board.nv,
                mem,
                cfg,
                saved,
                &plan.job,
                &mut cipher,
            )
        }
    } else {
        fn install_encrypted<F: Flash, E: Efuse>(
            _board: &mut Board<'_, F, E>,
            _cfg: &mut StartupCfg,
            _saved: &mut StartupCfg,
            _plan: &Plan,
        ) -> Result<UpgradeOutcome, BootError> {
            ringbuf_entry!(Trace::Rejected(BootError::NoCipher));
            Ok(UpgradeOutcome::Rejected)
        }
    }
}

/// Bumps and saves the restart counter, then writes the file into its
/// bank.
///
/// Only a failure to save the counter is returned as an error; once the
/// counter is saved a crash or failure anywhere below is recovered from by
/// the next boot.
fn install<F: Flash>(
    flash: &mut F,
    nv: &mut NvStore,
    mem: Workspace<'_>,
    cfg: &mut StartupCfg,
    saved: &mut StartupCfg,
    job: &Job,
    payload: &mut impl Payload,
) -> Result<UpgradeOutcome, BootError> {
    if job.compressed {
        let (probs, dict) = (mem.probs.len(), mem.dict.len());
        if let Err(e) = check_stream(flash, payload, job, probs, dict) {
            ringbuf_entry!(Trace::Rejected(e));
            return Ok(UpgradeOutcome::Rejected);
        }
    }

    cfg.reset_cnt = cfg.reset_cnt.saturating_add(1);
    ringbuf_entry!(Trace::State(BootState::UpgradeInProgress));
    persist(nv, flash, cfg, saved)?;

    match write_back(flash, mem, payload, job) {
        Ok(()) => {
            cfg.addr_start = job.dst.base;
            ringbuf_entry!(Trace::Installed {
                addr: job.dst.base
            });
            Ok(UpgradeOutcome::Installed)
        }
        Err(e) => {
            ringbuf_entry!(Trace::Failed(e));
            if e == BootError::Upg(UpgError::HashMismatch) {
                Ok(UpgradeOutcome::VerifyFailed)
            } else {
                Ok(UpgradeOutcome::WriteFailed)
            }
        }
    }
}
