// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::Write;

const SECTOR_SIZE: u32 = 0x1000;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Board {
    flash_size: u32,
    partitions: Partitions,
}

// Field order here is the order of `Partition` in src/lib.rs.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Partitions {
    boot: Region,
    factory_nv: Region,
    normal_nv: Region,
    normal_nv_backup: Region,
    kernel_a: Region,
    kernel_b: Region,
    factory: Region,
}

#[derive(Deserialize, Debug, Copy, Clone)]
#[serde(deny_unknown_fields)]
struct Region {
    base: u32,
    size: u32,
}

impl Partitions {
    fn named(&self) -> [(&'static str, Region); 7] {
        [
            ("boot", self.boot),
            ("factory-nv", self.factory_nv),
            ("normal-nv", self.normal_nv),
            ("normal-nv-backup", self.normal_nv_backup),
            ("kernel-a", self.kernel_a),
            ("kernel-b", self.kernel_b),
            ("factory", self.factory),
        ]
    }
}

fn check(board: &Board) -> Result<()> {
    let named = board.partitions.named();
    for (name, r) in &named {
        if r.size == 0 {
            bail!("partition {name} is empty");
        }
        if r.base % SECTOR_SIZE != 0 || r.size % SECTOR_SIZE != 0 {
            bail!("partition {name} is not sector aligned: {r:x?}");
        }
        let end = u64::from(r.base) + u64::from(r.size);
        if end > u64::from(board.flash_size) {
            bail!("partition {name} runs off the end of flash: {r:x?}");
        }
    }
    for (i, (a, ra)) in named.iter().enumerate() {
        for (b, rb) in &named[i + 1..] {
            if ra.base < rb.base + rb.size && rb.base < ra.base + ra.size {
                bail!("partitions {a} and {b} overlap");
            }
        }
    }
    if board.partitions.factory_nv.size % (2 * SECTOR_SIZE) != 0 {
        bail!("factory-nv must hold two equal banks of whole sectors");
    }
    Ok(())
}

fn main() -> Result<()> {
    let board: Board =
        build_util::board_config("BOARD_PARTITIONS", "board.toml")?;
    check(&board)?;

    let out = build_util::out_dir();
    let mut f = File::create(out.join("board.rs"))?;

    writeln!(f, "// Generated from the board configuration by build.rs.")?;
    writeln!(f, "pub const FLASH_SIZE: u32 = {:#x};", board.flash_size)?;
    writeln!(f, "pub const DEFAULT_TABLE: PartitionTable = PartitionTable {{")?;
    writeln!(f, "    regions: [")?;
    for (name, r) in board.partitions.named() {
        writeln!(
            f,
            "        Region {{ base: {:#x}, size: {:#x} }}, // {name}",
            r.base, r.size
        )?;
    }
    writeln!(f, "    ],")?;
    writeln!(f, "}};")?;

    Ok(())
}
