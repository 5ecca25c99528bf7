// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stand-ins for the cipher hardware, for running the boot stage on a host.
//!
//! None of this is cryptography. [`SimCipher`] is a keyed byte shuffle run
//! in CBC mode: it has the shape of AES-CBC (blocks, IV chaining, errors on
//! the wrong key show up as garbage) and nothing else.

use crate::{CipherEngine, CryptError, RootKey, Rng, IV_LEN, KEY_LEN};

const BLOCK: usize = 16;
const SHIFT: usize = 5;

#[derive(Default)]
pub struct SimCipher {
    /// Makes every call fail with [`CryptError::Engine`].
    pub broken: bool,
    /// Blocks processed so far.
    pub blocks: usize,
}

fn whiten(key: &[u8; KEY_LEN], i: usize) -> u8 {
    key[i] ^ key[i + BLOCK].rotate_left(1)
}

impl SimCipher {
    fn check(&mut self, data: &[u8]) -> Result<(), CryptError> {
        if self.broken {
            return Err(CryptError::Engine);
        }
        self.blocks += data.len() / BLOCK;
        Ok(())
    }
}

impl CipherEngine for SimCipher {
    fn cbc_decrypt(
        &mut self,
        key: &[u8; KEY_LEN],
        iv: &mut [u8; IV_LEN],
        data: &mut [u8],
    ) -> Result<(), CryptError> {
        self.check(data)?;
        for block in data.chunks_exact_mut(BLOCK) {
            let mut c = [0; BLOCK];
            c.copy_from_slice(block);
            for (j, b) in block.iter_mut().enumerate() {
                let i = (j + BLOCK - SHIFT) % BLOCK;
                *b = c[i] ^ whiten(key, i) ^ iv[j];
            }
            *iv = c;
        }
        Ok(())
    }

    fn cbc_encrypt(
        &mut self,
        key: &[u8; KEY_LEN],
        iv: &mut [u8; IV_LEN],
        data: &mut [u8],
    ) -> Result<(), CryptError> {
        self.check(data)?;
        for block in data.chunks_exact_mut(BLOCK) {
            let mut x = [0; BLOCK];
            for (j, b) in x.iter_mut().enumerate() {
                *b = block[j] ^ iv[j];
            }
            for (i, b) in block.iter_mut().enumerate() {
                *b = x[(i + SHIFT) % BLOCK] ^ whiten(key, i);
            }
            iv.copy_from_slice(block);
        }
        Ok(())
    }
}

/// Fixed device secret.
pub struct SimRootKey(pub [u8; KEY_LEN]);

impl RootKey for SimRootKey {
    fn secret(&mut self, out: &mut [u8; KEY_LEN]) -> Result<(), CryptError> {
        *out = self.0;
        Ok(())
    }
}

/// Deterministic xorshift generator.
pub struct SimRng(pub u32);

impl Rng for SimRng {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), CryptError> {
        for b in buf {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.0 = x;
            *b = x as u8;
        }
        Ok(())
    }
}
