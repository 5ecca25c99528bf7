// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Encrypted upgrade files.

use crate::writeback::Payload;
use crate::BootError;
use drv_flash_api::Flash;
use flash_crypt::{
    decrypt_at, decrypt_region, CipherEngine, KeySlot, KeyStore, RootKey,
    WorkKey,
};
use nv_store::NvStore;
use partition_table::Partition;

/// The cipher hardware and the device secret, lent to the boot stage.
pub struct Crypto<'a> {
    pub engine: &'a mut dyn CipherEngine,
    pub root: &'a mut dyn RootKey,
}

/// Decrypts section 0 with the work key of the bank it is written to.
pub(crate) struct Cipher<E> {
    engine: E,
    key: WorkKey,
}

impl<'a> Crypto<'a> {
    pub(crate) fn cipher_for(
        &mut self,
        nv: &mut NvStore,
        flash: &mut impl Flash,
        bank: Partition,
    ) -> Result<Cipher<&mut &'a mut dyn CipherEngine>, BootError> {
        let slot = match bank {
            Partition::KernelA => KeySlot::KernelA,
            Partition::KernelB => KeySlot::KernelB,
            _ => return Err(BootError::NoCipher),
        };
        let key = KeyStore::new(&mut self.engine, &mut self.root)
            .load(nv, flash, slot)?;
        Ok(Cipher {
            engine: &mut self.engine,
            key,
        })
    }
}

impl<E: CipherEngine> Payload for Cipher<E> {
    fn read_at(
        &mut self,
        flash: &mut impl Flash,
        addr: u32,
        len: u32,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize, BootError> {
        let n = decrypt_at(
            flash,
            &mut self.engine,
            &self.key,
            addr,
            len,
            offset,
            buf,
        )?;
        Ok(n)
    }

    fn copy(
        &mut self,
        flash: &mut impl Flash,
        src: u32,
        dst: u32,
        len: u32,
    ) -> Result<(), BootError> {
        decrypt_region(
            flash,
            &mut self.engine,
            &self.key,
            src,
            len,
            |flash, offset, chunk| {
                flash.write(dst + offset, chunk)?;
                Ok(())
            },
        )?;
        Ok(())
    }
}
