// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{
    check_blocks, CipherEngine, CryptError, WorkKey, CHUNK, CIPHER_BLOCK,
};
use drv_flash_api::Flash;
use zeroize::Zeroizing;

/// Decrypts the flash range `[addr, addr + len)` front to back, handing
/// each plaintext chunk and its offset in the range to `out`. `out` gets
/// the flash back, so it can program the plaintext somewhere else.
///
/// `len` must be a whole number of cipher blocks; otherwise nothing is
/// read and the result is [`CryptError::PartialBlock`].
pub fn decrypt_region<F: Flash>(
    flash: &mut F,
    engine: &mut impl CipherEngine,
    key: &WorkKey,
    addr: u32,
    len: u32,
    mut out: impl FnMut(&mut F, u32, &[u8]) -> Result<(), CryptError>,
) -> Result<(), CryptError> {
    check_blocks(len as usize)?;
    let mut iv = Zeroizing::new(*key.iv());
    let mut buf = Zeroizing::new([0u8; CHUNK]);
    let mut offset = 0;
    while offset < len {
        let n = (len - offset).min(CHUNK as u32) as usize;
        let chunk = &mut buf[..n];
        flash.read(addr + offset, chunk)?;
        engine.decrypt_blocks(key.key(), &mut iv, chunk)?;
        out(flash, offset, chunk)?;
        offset += n as u32;
    }
    Ok(())
}

/// Reads plaintext from offset `offset` of the encrypted range
/// `[addr, addr + len)` into `buf`, returning the number of bytes read
/// (short only at the end of the range).
///
/// In CBC any block can be decrypted on its own given the ciphertext block
/// before it, so reads can start anywhere.
pub fn decrypt_at(
    flash: &mut impl Flash,
    engine: &mut impl CipherEngine,
    key: &WorkKey,
    addr: u32,
    len: u32,
    offset: u32,
    buf: &mut [u8],
) -> Result<usize, CryptError> {
    check_blocks(len as usize)?;
    if offset >= len {
        return Ok(0);
    }
    let want = buf.len().min((len - offset) as usize);
    let block = CIPHER_BLOCK as u32;
    let mut chunk = Zeroizing::new([0u8; CHUNK]);
    let mut done = 0;
    while done < want {
        let pos = offset + done as u32;
        let start = pos - pos % block;
        let mut iv = Zeroizing::new(*key.iv());
        if start > 0 {
            flash.read(addr + start - block, &mut iv[..])?;
        }
        let n = (len - start).min(CHUNK as u32) as usize;
        flash.read(addr + start, &mut chunk[..n])?;
        engine.decrypt_blocks(key.key(), &mut iv, &mut chunk[..n])?;

        let skip = (pos - start) as usize;
        let take = (n - skip).min(want - done);
        buf[done..done + take].copy_from_slice(&chunk[skip..skip + take]);
        done += take;
    }
    Ok(done)
}
