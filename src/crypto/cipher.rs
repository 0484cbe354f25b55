// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Symmetric session-key cipher (§4.B, §9).
//!
//! The session key is exchanged once during `SAUTH` and then used to
//! encrypt every subsequent frame with CBC mode under a **fixed,
//! all-ones IV**. That is a known weakness inherited from the wire
//! protocol this crate implements rather than a new one — every block
//! boundary is deterministic across messages that share a key, so
//! higher layers must not assume semantic privacy from repeated
//! plaintext prefixes. See `SPEC_FULL.md` §9 for the accepted-risk
//! writeup; we do not attempt to silently "fix" it here because that
//! would break interoperability with peers that speak the real wire
//! format.

use aes::{Aes128, Aes192, Aes256};
use blowfish::Blowfish;
use cbc::cipher::{
    BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7,
};
use des::TdesEde3;
use rand::RngCore as _;
use thiserror::Error;

use crate::cfg::enums::CipherFamily;

/// Fixed IV used for every CBC operation, as fixed by the wire format.
const FIXED_IV: [u8; 8] = [0xff; 8];
const FIXED_IV_16: [u8; 16] = [0xff; 16];

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("unsupported key length {0} for cipher family {1}")]
    BadKeyLength(usize, CipherFamily),
    #[error("padding error during {0}")]
    Padding(&'static str),
}

/// A session key: raw bytes plus the cipher family they were generated
/// for. Sized per [`CipherFamily::key_len`].
#[derive(Clone)]
pub struct SessionKey {
    pub family: CipherFamily,
    pub bytes: Vec<u8>,
}

impl SessionKey {
    /// Generates a fresh random session key sized for `family`.
    pub fn generate(family: CipherFamily) -> Self {
        let mut bytes = vec![0u8; family.key_len()];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { family, bytes }
    }

    pub fn from_bytes(family: CipherFamily, bytes: Vec<u8>) -> Result<Self, CipherError> {
        if bytes.len() != family.key_len() {
            return Err(CipherError::BadKeyLength(bytes.len(), family));
        }
        Ok(Self { family, bytes })
    }
}

/// Encrypts `plaintext` under `key` using CBC/PKCS7 with the fixed IV.
pub fn encrypt_block(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    macro_rules! encrypt_with {
        ($cipher:ty, $iv:expr) => {{
            let enc = cbc::Encryptor::<$cipher>::new_from_slices(&key.bytes, $iv)
                .map_err(|_| CipherError::BadKeyLength(key.bytes.len(), key.family))?;
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        }};
    }

    match key.family {
        CipherFamily::Community => encrypt_with!(Blowfish, &FIXED_IV),
        CipherFamily::Aes128 => encrypt_with!(Aes128, &FIXED_IV_16),
        CipherFamily::Aes192 => encrypt_with!(Aes192, &FIXED_IV_16),
        CipherFamily::Aes256 => encrypt_with!(Aes256, &FIXED_IV_16),
        CipherFamily::TripleDes => encrypt_with!(TdesEde3, &FIXED_IV),
    }
}

/// Decrypts `ciphertext` under `key`, stripping PKCS7 padding.
pub fn decrypt_block(key: &SessionKey, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
    macro_rules! decrypt_with {
        ($cipher:ty, $iv:expr) => {{
            let dec = cbc::Decryptor::<$cipher>::new_from_slices(&key.bytes, $iv)
                .map_err(|_| CipherError::BadKeyLength(key.bytes.len(), key.family))?;
            let mut buf = ciphertext.to_vec();
            let len = dec
                .decrypt_padded_mut::<Pkcs7>(&mut buf)
                .map_err(|_| CipherError::Padding("decrypt"))?
                .len();
            buf.truncate(len);
            Ok(buf)
        }};
    }

    match key.family {
        CipherFamily::Community => decrypt_with!(Blowfish, &FIXED_IV),
        CipherFamily::Aes128 => decrypt_with!(Aes128, &FIXED_IV_16),
        CipherFamily::Aes192 => decrypt_with!(Aes192, &FIXED_IV_16),
        CipherFamily::Aes256 => decrypt_with!(Aes256, &FIXED_IV_16),
        CipherFamily::TripleDes => decrypt_with!(TdesEde3, &FIXED_IV),
    }
}
