// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! RSA key-pair load/save/generate (§4.B).
//!
//! New keys are always written unencrypted. A legacy passphrase-encrypted
//! PEM is still accepted on *load* for backward compatibility with key
//! material generated by older deployments; we never write that format
//! ourselves.

use std::{fs, path::Path};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use des::TdesEde3;
use md5::{Digest as _, Md5};
use rsa::{
    BigUint, RsaPrivateKey, RsaPublicKey,
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey},
    pkcs1::LineEnding,
    traits::PublicKeyParts,
};

use crate::error::{ProtocolError, Result};

/// The legacy passphrase used to encrypt private keys in older
/// deployments. New keys are never encrypted with it; it is retained only
/// so [`RsaKeyPair::load`] can still open old material.
const LEGACY_PASSPHRASE: &[u8] = b"Cfengine passphrase";

/// RSA 2048-bit with public exponent 35, as fixed by §4.B.
const KEY_BITS: usize = 2048;
const PUBLIC_EXPONENT: u64 = 35;

pub struct RsaKeyPair {
    pub private: RsaPrivateKey,
    pub public: RsaPublicKey,
}

impl RsaKeyPair {
    /// Generates a fresh 2048-bit key pair with the fixed public exponent.
    pub fn generate() -> Result<Self> {
        let exp = BigUint::from(PUBLIC_EXPONENT);
        let private =
            RsaPrivateKey::new_with_exp(&mut rand::rngs::OsRng, KEY_BITS, &exp)
                .map_err(|e| ProtocolError::Fatal(format!("RSA keygen failed: {e}")))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Loads the key pair, generating and persisting one on first run if
    /// the private key file doesn't exist yet.
    pub fn load_or_generate(priv_path: &Path, pub_path: &Path) -> Result<Self> {
        if priv_path.exists() {
            Self::load(priv_path, pub_path)
        } else {
            let pair = Self::generate()?;
            pair.save(priv_path, pub_path)?;
            Ok(pair)
        }
    }

    /// Loads a PEM-encoded RSA key pair from disk, falling back to the
    /// legacy passphrase-encrypted format if plain PKCS1 parsing fails.
    pub fn load(priv_path: &Path, pub_path: &Path) -> Result<Self> {
        let priv_pem = fs::read_to_string(priv_path).map_err(|e| {
            ProtocolError::Fatal(format!("reading private key {priv_path:?}: {e}"))
        })?;

        let private = RsaPrivateKey::from_pkcs1_pem(&priv_pem)
            .or_else(|_| decrypt_legacy_private_key(&priv_pem))
            .map_err(|e| {
                ProtocolError::Fatal(format!("parsing private key {priv_path:?}: {e}"))
            })?;

        let public = if pub_path.exists() {
            let pub_pem = fs::read_to_string(pub_path).map_err(|e| {
                ProtocolError::Fatal(format!("reading public key {pub_path:?}: {e}"))
            })?;
            RsaPublicKey::from_pkcs1_pem(&pub_pem).map_err(|e| {
                ProtocolError::Fatal(format!("parsing public key {pub_path:?}: {e}"))
            })?
        } else {
            RsaPublicKey::from(&private)
        };

        Ok(Self { private, public })
    }

    /// Writes both halves of the key pair as unencrypted PEM, mode 0600,
    /// via rename-into-place (§5 write policy).
    pub fn save(&self, priv_path: &Path, pub_path: &Path) -> Result<()> {
        let priv_pem = self
            .private
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| ProtocolError::Fatal(format!("encoding private key: {e}")))?;
        let pub_pem = self
            .public
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| ProtocolError::Fatal(format!("encoding public key: {e}")))?;

        write_atomic_0600(priv_path, priv_pem.as_bytes())?;
        write_atomic_0600(pub_path, pub_pem.as_bytes())?;
        Ok(())
    }
}

/// Atomically write `contents` to `path` mode 0600 via a temp file in the
/// same directory followed by `rename`, matching the key-store's
/// rename-into-place write policy (§5).
pub fn write_atomic_0600(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .map_err(|e| ProtocolError::Fatal(format!("creating {dir:?}: {e}")))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(|e| ProtocolError::Fatal(format!("creating temp file in {dir:?}: {e}")))?;

    use std::io::Write as _;
    tmp.write_all(contents)
        .map_err(|e| ProtocolError::Fatal(format!("writing temp file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))
            .map_err(|e| ProtocolError::Fatal(format!("chmod temp file: {e}")))?;
    }

    tmp.persist(path)
        .map_err(|e| ProtocolError::Fatal(format!("renaming into {path:?}: {e}")))?;
    Ok(())
}

/// Decrypts a legacy OpenSSL `Proc-Type: 4,ENCRYPTED` / `DEK-Info:
/// DES-EDE3-CBC,<iv>` PKCS1 PEM using the fixed legacy passphrase. New keys
/// never use this format; it exists purely to open old key material.
fn decrypt_legacy_private_key(pem: &str) -> std::result::Result<RsaPrivateKey, String> {
    let (header, der_b64) = split_pem_headers(pem)?;
    let dek_info = header
        .get("DEK-Info")
        .ok_or_else(|| "missing DEK-Info header".to_string())?;
    let (cipher, iv_hex) = dek_info
        .split_once(',')
        .ok_or_else(|| "malformed DEK-Info".to_string())?;
    if cipher != "DES-EDE3-CBC" {
        return Err(format!("unsupported legacy cipher {cipher}"));
    }
    let iv = hex::decode(iv_hex.trim()).map_err(|e| e.to_string())?;
    if iv.len() != 8 {
        return Err("DES-EDE3-CBC IV must be 8 bytes".to_string());
    }

    let ciphertext = BASE64.decode(der_b64.as_bytes()).map_err(|e| e.to_string())?;
    let key = openssl_evp_bytes_to_key(LEGACY_PASSPHRASE, &iv[..8], 24);

    type TdesCbcDec = cbc::Decryptor<TdesEde3>;
    let decryptor = TdesCbcDec::new_from_slices(&key, &iv)
        .map_err(|e| format!("bad legacy key/iv: {e}"))?;
    let mut buf = ciphertext;
    let plaintext = decryptor
        .decrypt_padded_mut::<cbc::cipher::block_padding::Pkcs7>(&mut buf)
        .map_err(|e| format!("legacy decrypt failed: {e}"))?;

    RsaPrivateKey::from_pkcs1_der(plaintext).map_err(|e| e.to_string())
}

/// OpenSSL's legacy (non-PBKDF2) `EVP_BytesToKey` derivation with MD5,
/// single iteration — the scheme used by traditional encrypted PEM files.
fn openssl_evp_bytes_to_key(passphrase: &[u8], salt: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(passphrase);
        hasher.update(salt);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

/// Splits a PEM block's headers (`Key: Value` lines right after the
/// `-----BEGIN ... -----` line) from its base64 body.
fn split_pem_headers(
    pem: &str,
) -> std::result::Result<(std::collections::HashMap<String, String>, String), String> {
    let mut lines = pem.lines();
    let first = lines.next().ok_or_else(|| "empty PEM".to_string())?;
    if !first.starts_with("-----BEGIN") {
        return Err("missing PEM BEGIN line".to_string());
    }

    let mut headers = std::collections::HashMap::new();
    let mut body = String::new();
    for line in lines {
        if line.starts_with("-----END") {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_string(), v.trim().to_string());
        } else {
            body.push_str(line.trim());
        }
    }
    Ok((headers, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_save_and_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let priv_path = dir.path().join("localhost.priv");
        let pub_path = dir.path().join("localhost.pub");

        let pair = RsaKeyPair::generate().expect("generate");
        pair.save(&priv_path, &pub_path).expect("save");

        let reloaded = RsaKeyPair::load(&priv_path, &pub_path).expect("load");
        assert_eq!(pair.public.n(), reloaded.public.n());
        assert_eq!(pair.public.e(), reloaded.public.e());
    }

    #[test]
    fn load_or_generate_persists_on_first_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let priv_path = dir.path().join("localhost.priv");
        let pub_path = dir.path().join("localhost.pub");

        assert!(!priv_path.exists());
        let first = RsaKeyPair::load_or_generate(&priv_path, &pub_path).expect("first");
        assert!(priv_path.exists());

        let second = RsaKeyPair::load_or_generate(&priv_path, &pub_path).expect("second");
        assert_eq!(first.public.n(), second.public.n());
    }
}
