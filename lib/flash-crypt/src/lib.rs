// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash encryption support for the boot stage.
//!
//! Each kernel bank has its own work key. The key and the IV it is used
//! with are kept in a [`CryptoContent`] record in the factory NV store,
//! twice (primary and backup). A record carries a SHA-256 over its own
//! plaintext and is sealed with a key derived from the device root secret,
//! so a torn or foreign copy fails to verify and the other copy is used.
//!
//! The block cipher itself is a collaborator ([`CipherEngine`]); this crate
//! only does the bookkeeping around it.

#![cfg_attr(not(test), no_std)]

use core::mem::size_of;
use drv_flash_api::{Flash, FlashError};
use nv_store::{id, NvError, NvStore};
use ringbuf::{ringbuf, ringbuf_entry};
use sha2::{Digest, Sha256};
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

mod region;
pub mod sim;

pub use region::{decrypt_at, decrypt_region};

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const SALT_LEN: usize = 32;
pub const HASH_LEN: usize = 32;
pub const CIPHER_BLOCK: usize = 16;
pub const KDF_ITERATIONS: u32 = 1024;

/// Unit in which regions are read and decrypted.
pub const CHUNK: usize = 0x100;

/// The salt and IV of the sealing key are stored in the clear; everything
/// after them is sealed.
const SEALED_START: usize = SALT_LEN + IV_LEN;
/// Bytes covered by `content_hash`.
const HASHED_LEN: usize = size_of::<CryptoContent>() - HASH_LEN;


#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Loaded { id: u8 },
    Missing { id: u8 },
    Invalid { id: u8 },
    Restored { id: u8 },
    Generated(KeySlot),
    Stored { id: u8 },
}

ringbuf!(Trace, 16, Trace::None);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CryptError {
    /// A length that is not a whole number of cipher blocks.
    PartialBlock,
    /// A key record is present but does not verify.
    BadRecord,
    /// Neither copy of the key record exists.
    NoKey,
    Kdf,
    Engine,
    Rng,
    Nv(NvError),
    Flash(FlashError),
}

impl From<NvError> for CryptError {
    fn from(e: NvError) -> Self {
        CryptError::Nv(e)
    }
}

impl From<FlashError> for CryptError {
    fn from(e: FlashError) -> Self {
        CryptError::Flash(e)
    }
}

/// Kernel bank a work key belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KeySlot {
    KernelA,
    KernelB,
}

impl KeySlot {
    /// NV ids of the primary and the backup record.
    pub fn record_ids(self) -> (u8, u8) {
        match self {
            KeySlot::KernelA => (id::KERNEL_A_KEY, id::KERNEL_A_KEY_BACKUP),
            KeySlot::KernelB => (id::KERNEL_B_KEY, id::KERNEL_B_KEY_BACKUP),
        }
    }
}

/// The persisted key record, as plaintext.
#[derive(
    Clone,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Zeroize,
    ZeroizeOnDrop,
)]
#[repr(C)]
pub struct CryptoContent {
    /// Salt for the sealing key.
    pub root_salt: [u8; SALT_LEN],
    /// IV for sealing the rest of the record.
    pub iv_nv: [u8; IV_LEN],
    /// IV the work key is used with.
    pub iv_content: [u8; IV_LEN],
    pub work_key: [u8; KEY_LEN],
    /// SHA-256 over everything above.
    pub content_hash: [u8; HASH_LEN],
}

const_assert_eq!(size_of::<CryptoContent>(), 128);
const_assert_eq!((size_of::<CryptoContent>() - SEALED_START) % 16, 0);

impl CryptoContent {
    pub fn hash(&self) -> [u8; HASH_LEN] {
        Sha256::digest(&self.as_bytes()[..HASHED_LEN]).into()
    }

    pub fn is_intact(&self) -> bool {
        self.hash() == self.content_hash
    }
}

/// A work key and the IV that goes with it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WorkKey {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl WorkKey {
    pub fn new(key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self { key, iv }
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }
}

impl From<&CryptoContent> for WorkKey {
    fn from(c: &CryptoContent) -> Self {
        Self::new(c.work_key, c.iv_content)
    }
}

pub(crate) fn check_blocks(len: usize) -> Result<(), CryptError> {
    if len % CIPHER_BLOCK != 0 {
        return Err(CryptError::PartialBlock);
    }
    Ok(())
}

/// AES-256-CBC, normally the SoC cipher block.
pub trait CipherEngine {
    /// Decrypts `data` (whole blocks) in place and leaves `iv` holding the
    /// last ciphertext block, ready for the data that follows.
    fn cbc_decrypt(
        &mut self,
        key: &[u8; KEY_LEN],
        iv: &mut [u8; IV_LEN],
        data: &mut [u8],
    ) -> Result<(), CryptError>;

    /// Encrypts `data` (whole blocks) in place and leaves `iv` holding the
    /// last ciphertext block.
    fn cbc_encrypt(
        &mut self,
        key: &[u8; KEY_LEN],
        iv: &mut [u8; IV_LEN],
        data: &mut [u8],
    ) -> Result<(), CryptError>;

    /// Like [`CipherEngine::cbc_decrypt`], but refuses a trailing partial
    /// block before anything is decrypted.
    fn decrypt_blocks(
        &mut self,
        key: &[u8; KEY_LEN],
        iv: &mut [u8; IV_LEN],
        data: &mut [u8],
    ) -> Result<(), CryptError> {
        check_blocks(data.len())?;
        self.cbc_decrypt(key, iv, data)
    }

    fn encrypt_blocks(
        &mut self,
        key: &[u8; KEY_LEN],
        iv: &mut [u8; IV_LEN],
        data: &mut [u8],
    ) -> Result<(), CryptError> {
        check_blocks(data.len())?;
        self.cbc_encrypt(key, iv, data)
    }
}

impl<E: CipherEngine + ?Sized> CipherEngine for &mut E {
    fn cbc_decrypt(
        &mut self,
        key: &[u8; KEY_LEN],
        iv: &mut [u8; IV_LEN],
        data: &mut [u8],
    ) -> Result<(), CryptError> {
        (**self).cbc_decrypt(key, iv, data)
    }

    fn cbc_encrypt(
        &mut self,
        key: &[u8; KEY_LEN],
        iv: &mut [u8; IV_LEN],
        data: &mut [u8],
    ) -> Result<(), CryptError> {
        (**self).cbc_encrypt(key, iv, data)
    }
}

/// Source of the device-unique root secret.
pub trait RootKey {
    fn secret(&mut self, out: &mut [u8; KEY_LEN]) -> Result<(), CryptError>;
}

impl<R: RootKey + ?Sized> RootKey for &mut R {
    fn secret(&mut self, out: &mut [u8; KEY_LEN]) -> Result<(), CryptError> {
        (**self).secret(out)
    }
}

/// Hardware random number generator.
pub trait Rng {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), CryptError>;
}

/// PBKDF2-HMAC-SHA256 with a single output block.
fn pbkdf2_sha256(
    secret: &[u8],
    salt: &[u8],
    rounds: u32,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptError> {
    if rounds == 0 {
        return Err(CryptError::Kdf);
    }
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, rounds, &mut out[..]);
    Ok(out)
}

/// Stretches `secret` and `salt` into a 256-bit key with
/// [`KDF_ITERATIONS`] rounds of PBKDF2-HMAC-SHA256.
pub fn derive_work_key(
    secret: &[u8],
    salt: &[u8],
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptError> {
    pbkdf2_sha256(secret, salt, KDF_ITERATIONS)
}

/// Loads, repairs and creates the work key records.
pub struct KeyStore<'a, E: CipherEngine, R: RootKey> {
    engine: &'a mut E,
    root: &'a mut R,
}

enum Lookup {
    Found(CryptoContent),
    Missing,
    Invalid,
}

impl<'a, E: CipherEngine, R: RootKey> KeyStore<'a, E, R> {
    pub fn new(engine: &'a mut E, root: &'a mut R) -> Self {
        Self { engine, root }
    }

    /// Returns the work key for `slot`.
    ///
    /// The primary record is used if it verifies. Otherwise the backup is
    /// used and copied over the primary. With no backup this is
    /// [`CryptError::NoKey`], and with a bad one [`CryptError::BadRecord`].
    pub fn load(
        &mut self,
        nv: &mut NvStore,
        flash: &mut impl Flash,
        slot: KeySlot,
    ) -> Result<WorkKey, CryptError> {
        match self.recover(nv, flash, slot)? {
            Some(c) => Ok(WorkKey::from(&c)),
            None => Err(CryptError::NoKey),
        }
    }

    /// Like [`KeyStore::load`], but when there is no backup record a fresh
    /// key is generated and written as both primary and backup.
    pub fn load_or_create(
        &mut self,
        nv: &mut NvStore,
        flash: &mut impl Flash,
        rng: &mut impl Rng,
        slot: KeySlot,
    ) -> Result<WorkKey, CryptError> {
        if let Some(c) = self.recover(nv, flash, slot)? {
            return Ok(WorkKey::from(&c));
        }

        let c = generate(rng)?;
        let (primary, backup) = slot.record_ids();
        self.store(nv, flash, primary, &c)?;
        self.store(nv, flash, backup, &c)?;
        ringbuf_entry!(Trace::Generated(slot));
        Ok(WorkKey::from(&c))
    }

    fn recover(
        &mut self,
        nv: &mut NvStore,
        flash: &mut impl Flash,
        slot: KeySlot,
    ) -> Result<Option<CryptoContent>, CryptError> {
        let (primary, backup) = slot.record_ids();
        if let Lookup::Found(c) = self.fetch(nv, flash, primary)? {
            return Ok(Some(c));
        }
        match self.fetch(nv, flash, backup)? {
            Lookup::Found(c) => {
                self.store(nv, flash, primary, &c)?;
                ringbuf_entry!(Trace::Restored { id: primary });
                Ok(Some(c))
            }
            Lookup::Missing => Ok(None),
            Lookup::Invalid => Err(CryptError::BadRecord),
        }
    }

    fn sealing_key(
        &mut self,
        salt: &[u8; SALT_LEN],
    ) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptError> {
        let mut secret = Zeroizing::new([0; KEY_LEN]);
        self.root.secret(&mut secret)?;
        derive_work_key(&*secret, salt)
    }

    fn fetch(
        &mut self,
        nv: &NvStore,
        flash: &mut impl Flash,
        id: u8,
    ) -> Result<Lookup, CryptError> {
        let mut c = match nv.read_record::<CryptoContent>(flash, id) {
            Ok(c) => c,
            Err(NvError::NotFound) => {
                ringbuf_entry!(Trace::Missing { id });
                return Ok(Lookup::Missing);
            }
            Err(NvError::BadLength) => {
                ringbuf_entry!(Trace::Invalid { id });
                return Ok(Lookup::Invalid);
            }
            Err(e) => return Err(e.into()),
        };
        // A cleared record.
        if c.work_key.iter().all(|&b| b == 0) {
            ringbuf_entry!(Trace::Missing { id });
            return Ok(Lookup::Missing);
        }

        let key = self.sealing_key(&c.root_salt)?;
        let mut iv = c.iv_nv;
        self.engine.decrypt_blocks(
            &key,
            &mut iv,
            &mut c.as_mut_bytes()[SEALED_START..],
        )?;
        if !c.is_intact() {
            ringbuf_entry!(Trace::Invalid { id });
            return Ok(Lookup::Invalid);
        }
        ringbuf_entry!(Trace::Loaded { id });
        Ok(Lookup::Found(c))
    }

    fn store(
        &mut self,
        nv: &mut NvStore,
        flash: &mut impl Flash,
        id: u8,
        content: &CryptoContent,
    ) -> Result<(), CryptError> {
        let mut sealed = content.clone();
        let key = self.sealing_key(&sealed.root_salt)?;
        let mut iv = sealed.iv_nv;
        self.engine.encrypt_blocks(
            &key,
            &mut iv,
            &mut sealed.as_mut_bytes()[SEALED_START..],
        )?;
        nv.write_record(flash, id, &sealed)?;
        ringbuf_entry!(Trace::Stored { id });
        Ok(())
    }
}

fn generate(rng: &mut impl Rng) -> Result<CryptoContent, CryptError> {
    let mut c = CryptoContent::new_zeroed();
    rng.fill(&mut c.root_salt)?;
    rng.fill(&mut c.iv_nv)?;
    rng.fill(&mut c.iv_content)?;

    let mut seed = Zeroizing::new([0u8; KEY_LEN]);
    let mut salt = [0u8; IV_LEN];
    rng.fill(&mut *seed)?;
    rng.fill(&mut salt)?;
    c.work_key = *derive_work_key(&*seed, &salt)?;
    c.content_hash = c.hash();
    Ok(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn pbkdf2_single_round() {
        let k = pbkdf2_sha256(b"passwd", b"salt", 1).unwrap();
        assert_eq!(
            k.to_vec(),
            hex("55ac046e56e3089fec1691c22544b605\
                 f94185216dde0465e68b9d57c20dacbc")
        );
    }

    #[test]
    fn pbkdf2_many_rounds() {
        let k = pbkdf2_sha256(b"password", b"salt", 4096).unwrap();
        assert_eq!(
            k.to_vec(),
            hex("c5e478d59288c841aa530db6845c4c8d\
                 962893a001ce4e11a4963873aa98134a")
        );
    }

    #[test]
    fn zero_rounds_is_refused() {
        assert_eq!(
            pbkdf2_sha256(b"password", b"salt", 0).map(|k| *k),
            Err(CryptError::Kdf)
        );
    }

    #[test]
    fn work_key_uses_fixed_round_count() {
        let secret: Vec<u8> = (0..32).collect();
        let salt: Vec<u8> = (100..116).collect();
        let k = derive_work_key(&secret, &salt).unwrap();
        assert_eq!(
            k.to_vec(),
            hex("631f5f4bce238c350e517f7d29966b1d\
                 9f4a3a06abcdc374830a55d8ebf95867")
        );
    }

    #[test]
    fn hash_covers_all_but_itself() {
        let mut c = CryptoContent::new_zeroed();
        c.content_hash = c.hash();
        assert!(c.is_intact());
        c.content_hash[0] ^= 1;
        assert!(!c.is_intact());
        c.content_hash[0] ^= 1;
        c.iv_content[15] ^= 1;
        assert!(!c.is_intact());
    }

    #[test]
    fn slots_use_their_own_records() {
        assert_eq!(KeySlot::KernelA.record_ids(), (4, 5));
        assert_eq!(KeySlot::KernelB.record_ids(), (6, 7));
    }
}
