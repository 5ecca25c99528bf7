// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What the boot stage tells the kernel it booted.
//!
//! Before jumping, the boot stage serializes a [`BootHandoff`] into a RAM
//! area agreed with the kernel. The kernel reads it back with
//! [`BootHandoff::load`] to find out which bank it is running from and
//! whether an upgrade just happened.

use hubpack::SerializedSize;
use serde::{Deserialize, Serialize};

pub const HANDOFF_VERSION: u32 = 1;
pub const HANDOFF_MAGIC: [u8; 12] = *b"hi-flashboot";

/// Bytes a handoff area needs to hold the largest [`BootHandoff`].
pub const HANDOFF_SIZE: usize = Header::MAX_SIZE + BootHandoff::MAX_SIZE;

/// Version first, so the layout behind it can change; then a magic for
/// anyone reading a memory dump.
#[derive(Deserialize, Serialize, SerializedSize)]
struct Header {
    version: u32,
    magic: [u8; 12],
}

/// States of the boot decision.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Deserialize,
    Serialize,
    SerializedSize,
)]
pub enum BootState {
    Normal,
    /// An upgrade file was found and is being checked.
    UpgradePending,
    /// The file checked out; the target bank is being rewritten.
    UpgradeInProgress,
    Rollback,
}

#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Deserialize,
    Serialize,
    SerializedSize,
)]
pub enum UpgradeOutcome {
    Installed,
    /// The file failed validation; nothing was written.
    Rejected,
    /// The written image did not match its hash.
    VerifyFailed,
    WriteFailed,
    /// The restart counter ran past its limit.
    RetriesExhausted,
    /// Upgrade mode, but no file at the staging address.
    NoImage,
}

#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Deserialize,
    Serialize,
    SerializedSize,
)]
pub enum Slot {
    A,
    B,
    Factory,
}

#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Deserialize,
    Serialize,
    SerializedSize,
)]
pub struct BootHandoff {
    pub booted: Slot,
    /// Address control is handed to.
    pub addr: u32,
    /// Final state of the decision.
    pub state: BootState,
    pub reset_cnt: u8,
    pub upgrade: Option<UpgradeOutcome>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandoffError {
    /// The area is too small.
    Serialize,
    Deserialize,
    BadMagic,
    UnexpectedVersion(u32),
}

impl BootHandoff {
    /// Writes the header and then `self` to the front of `dst`, returning
    /// the number of bytes used.
    pub fn store(&self, dst: &mut [u8]) -> Result<usize, HandoffError> {
        let header = Header {
            version: HANDOFF_VERSION,
            magic: HANDOFF_MAGIC,
        };
        let n = hubpack::serialize(dst, &header)
            .map_err(|_| HandoffError::Serialize)?;
        let rest = dst.get_mut(n..).ok_or(HandoffError::Serialize)?;
        let m = hubpack::serialize(rest, self)
            .map_err(|_| HandoffError::Serialize)?;
        Ok(n + m)
    }

    pub fn load(src: &[u8]) -> Result<Self, HandoffError> {
        let (header, rest) = hubpack::deserialize::<Header>(src)
            .map_err(|_| HandoffError::Deserialize)?;
        if header.version != HANDOFF_VERSION {
            return Err(HandoffError::UnexpectedVersion(header.version));
        }
        if header.magic != HANDOFF_MAGIC {
            return Err(HandoffError::BadMagic);
        }
        let (data, _) = hubpack::deserialize::<Self>(rest)
            .map_err(|_| HandoffError::Deserialize)?;
        Ok(data)
    }
}
