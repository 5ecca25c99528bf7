// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod common;

use common::*;
use drv_efuse::SimEfuse;
use drv_flash_api::STATUS2_QE;
use flashboot::*;
use partition_table::{Region, FLASH_SIZE};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Records what the boot stage asks of the chip. Jumping and resetting
/// unwind with a message saying which happened.
struct Chip {
    area: [u8; HANDOFF_SIZE],
    log: Vec<String>,
    delays: Vec<u32>,
}

impl Chip {
    fn new() -> Self {
        Self {
            area: [0; HANDOFF_SIZE],
            log: vec![],
            delays: vec![],
        }
    }
}

impl Platform for Chip {
    fn debug_msg(&mut self, msg: &str) {
        self.log.push(msg.to_string());
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delays.push(ms);
    }

    fn handoff_area(&mut self) -> &mut [u8] {
        &mut self.area
    }

    fn jump(&mut self, addr: u32) -> ! {
        panic!("jump {addr:#x}")
    }

    fn reset(&mut self) -> ! {
        panic!("reset")
    }
}

/// Runs `f`, which must end in a jump or reset, and returns which.
fn exit_of(f: impl FnOnce()) -> String {
    let payload = catch_unwind(AssertUnwindSafe(f)).unwrap_err();
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        payload.downcast_ref::<&str>().unwrap().to_string()
    }
}

#[test]
fn boot_jumps_with_a_handoff() {
    let mut rig = Rig::new();
    let mut board = rig.board();
    let mut chip = Chip::new();

    let exit = exit_of(|| {
        execute_upg_boot(&mut board, &mut chip);
    });
    assert_eq!(exit, "jump 0xd000");
    assert!(chip.log.is_empty());

    let h = BootHandoff::load(&chip.area).unwrap();
    assert_eq!(h.addr, KERNEL_A);
    assert_eq!(h.booted, Slot::A);
    assert_eq!(h.upgrade, Some(UpgradeOutcome::NoImage));
}

#[test]
fn unsaveable_record_resets_the_chip() {
    let mut rig = Rig::new();
    let mut board = rig.board();
    board.flash.bad = Some(Region {
        base: 0,
        size: FLASH_SIZE,
    });
    let mut chip = Chip::new();

    let exit = exit_of(|| {
        execute_upg_boot(&mut board, &mut chip);
    });
    assert_eq!(exit, "reset");
    assert_eq!(chip.log, ["upg boot err"]);
    assert_eq!(chip.delays, [RESET_DELAY_MS]);
}

#[test]
fn power_on_sets_quad_mode_and_boots() {
    let mut rig = Rig::new();
    let (mut flash, res) = rig.parts();
    let mut chip = Chip::new();

    let exit = exit_of(|| {
        start(&mut chip, &mut flash, SimEfuse::new(), res);
    });
    assert_eq!(exit, "jump 0xd000");
    assert_ne!(flash.status2 & STATUS2_QE, 0);
    // No partition table was programmed; the built-in one is used.
    assert_eq!(chip.log, ["parti err"]);
    assert_eq!(
        BootHandoff::load(&chip.area).map(|h| h.addr),
        Ok(KERNEL_A)
    );
}
