//! [`SessionKeys`]: symmetric keys derived per secure channel with P_SHA256.

use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{PolicyError, NONCE_LEN};

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of an HMAC-SHA-256 signature.
pub const SIGNATURE_LEN: usize = 32;

/// AES block length.
pub const BLOCK_LEN: usize = 16;

const SIGNING_KEY_LEN: usize = 32;
const ENCRYPTING_KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const KEY_SET_LEN: usize = SIGNING_KEY_LEN + ENCRYPTING_KEY_LEN + IV_LEN;

/// One direction's keys. Zeroed on drop.
struct KeySet {
    signing_key: [u8; SIGNING_KEY_LEN],
    encrypting_key: [u8; ENCRYPTING_KEY_LEN],
    iv: [u8; IV_LEN],
}

impl KeySet {
    fn derive(secret: &[u8], seed: &[u8]) -> Self {
        let mut material = p_sha256(secret, seed, KEY_SET_LEN);
        let mut keys = Self {
            signing_key: [0; SIGNING_KEY_LEN],
            encrypting_key: [0; ENCRYPTING_KEY_LEN],
            iv: [0; IV_LEN],
        };
        let (signing, rest) = material.split_at(SIGNING_KEY_LEN);
        let (encrypting, iv) = rest.split_at(ENCRYPTING_KEY_LEN);
        keys.signing_key.copy_from_slice(signing);
        keys.encrypting_key.copy_from_slice(encrypting);
        keys.iv.copy_from_slice(iv);
        material.iter_mut().for_each(|b| *b = 0);
        keys
    }

    fn mac(&self) -> HmacSha256 {
        hmac_sha256(&self.signing_key)
    }
}

impl Drop for KeySet {
    fn drop(&mut self) {
        self.signing_key.iter_mut().for_each(|b| *b = 0);
        self.encrypting_key.iter_mut().for_each(|b| *b = 0);
        self.iv.iter_mut().for_each(|b| *b = 0);
    }
}

/// Keys for one secure channel.
///
/// `local` protects what this side sends, `remote` opens what it receives.
/// Both ends derive the same two sets with the roles swapped.
pub struct SessionKeys {
    local: KeySet,
    remote: KeySet,
}

impl SessionKeys {
    /// Local keys are `P_SHA256(remote_nonce, local_nonce)`, remote keys are
    /// `P_SHA256(local_nonce, remote_nonce)`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NonceLength`] unless both nonces are
    /// [`NONCE_LEN`] bytes.
    pub fn derive(remote_nonce: &[u8], local_nonce: &[u8]) -> Result<Self, PolicyError> {
        for nonce in [remote_nonce, local_nonce] {
            if nonce.len() != NONCE_LEN {
                return Err(PolicyError::NonceLength(nonce.len()));
            }
        }
        Ok(Self {
            local: KeySet::derive(remote_nonce, local_nonce),
            remote: KeySet::derive(local_nonce, remote_nonce),
        })
    }

    /// HMAC-SHA-256 with the local signing key.
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut mac = self.local.mac();
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time check of a signature made with the remote signing key.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let mut mac = self.remote.mac();
        mac.update(data);
        mac.verify_slice(signature).is_ok()
    }

    /// AES-256-CBC encrypt `buf` in place with the local keys.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::BlockAlignment`] unless `buf` is a multiple of
    /// [`BLOCK_LEN`].
    pub fn encrypt(&self, buf: &mut [u8]) -> Result<(), PolicyError> {
        check_alignment(buf)?;
        let len = buf.len();
        Aes256CbcEnc::new_from_slices(&self.local.encrypting_key, &self.local.iv)
            .map_err(|_| PolicyError::Cipher)?
            .encrypt_padded_mut::<NoPadding>(buf, len)
            .map_err(|_| PolicyError::Cipher)?;
        Ok(())
    }

    /// AES-256-CBC decrypt `buf` in place with the remote keys.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::BlockAlignment`] unless `buf` is a multiple of
    /// [`BLOCK_LEN`].
    pub fn decrypt(&self, buf: &mut [u8]) -> Result<(), PolicyError> {
        check_alignment(buf)?;
        Aes256CbcDec::new_from_slices(&self.remote.encrypting_key, &self.remote.iv)
            .map_err(|_| PolicyError::Cipher)?
            .decrypt_padded_mut::<NoPadding>(buf)
            .map_err(|_| PolicyError::Cipher)?;
        Ok(())
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys([REDACTED])")
    }
}

fn check_alignment(buf: &[u8]) -> Result<(), PolicyError> {
    if buf.len() % BLOCK_LEN != 0 {
        return Err(PolicyError::BlockAlignment(buf.len()));
    }
    Ok(())
}

fn hmac_sha256(key: &[u8]) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length")
}

/// P_SHA256 from RFC 5246 section 5, truncated to `len` bytes.
fn p_sha256(secret: &[u8], seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + SIGNATURE_LEN);
    // A(1) = HMAC(secret, seed)
    let mut a = {
        let mut mac = hmac_sha256(secret);
        mac.update(seed);
        mac.finalize().into_bytes()
    };
    while out.len() < len {
        let mut mac = hmac_sha256(secret);
        mac.update(&a);
        mac.update(seed);
        out.extend_from_slice(&mac.finalize().into_bytes());

        let mut mac = hmac_sha256(secret);
        mac.update(&a);
        a = mac.finalize().into_bytes();
    }
    out.truncate(len);
    out
}
