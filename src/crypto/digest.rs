// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Peer identity digest (§3, §4.B): a printable hash of an RSA public key,
//! computed over a canonical MPI-encoded concatenation of the modulus and
//! exponent. SHA-256 is the default; a legacy MD5 variant is kept solely
//! for the upgrade-compatibility compare step the `MD5` command uses
//! (§4.I).

use md5::Md5;
use rsa::{RsaPublicKey, traits::PublicKeyParts};
use sha2::{Digest as _, Sha256};

/// Big-endian MPI encoding: a 2-byte big-endian byte-count prefix followed
/// by the minimal big-endian representation of the value. This is the
/// canonical encoding every digest and handshake message in this crate uses
/// when it needs to put an RSA component on the wire or into a hash.
pub fn to_mpi(value: &rsa::BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let len = bytes.len() as u16;
    let mut out = Vec::with_capacity(2 + bytes.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&bytes);
    out
}

/// Inverse of [`to_mpi`]: reads a 2-byte length prefix followed by that
/// many big-endian bytes, returning the value and the number of bytes
/// consumed.
pub fn from_mpi(buf: &[u8]) -> Option<(rsa::BigUint, usize)> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let total = 2 + len;
    if buf.len() < total {
        return None;
    }
    Some((rsa::BigUint::from_bytes_be(&buf[2..total]), total))
}

fn canonical_encoding(key: &RsaPublicKey) -> Vec<u8> {
    let mut buf = to_mpi(key.n());
    buf.extend_from_slice(&to_mpi(key.e()));
    buf
}

/// The canonical peer identity: lowercase hex SHA-256 over the canonical
/// MPI encoding of `(n, e)`.
pub fn peer_digest(key: &RsaPublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_encoding(key));
    hex::encode(hasher.finalize())
}

/// Legacy MD5 digest, kept only so `MD5`/`SMD5` handlers can accept either
/// digest during an upgrade window (§4.I).
pub fn peer_digest_legacy(key: &RsaPublicKey) -> String {
    let mut hasher = Md5::new();
    hasher.update(canonical_encoding(key));
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use rsa::{RsaPrivateKey, pkcs1::DecodeRsaPublicKey as _};

    use super::*;

    fn test_key() -> RsaPublicKey {
        let priv_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024)
            .expect("key generation should not fail in tests");
        RsaPublicKey::from(&priv_key)
    }

    #[test]
    fn digest_is_deterministic() {
        let key = test_key();
        assert_eq!(peer_digest(&key), peer_digest(&key));
    }

    #[test]
    fn digest_differs_between_distinct_keys() {
        let a = test_key();
        let b = test_key();
        assert_ne!(peer_digest(&a), peer_digest(&b));
    }

    #[test]
    fn mpi_round_trips() {
        let value = rsa::BigUint::from(65537u32);
        let encoded = to_mpi(&value);
        let (decoded, consumed) = from_mpi(&encoded).expect("decode");
        assert_eq!(decoded, value);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn mpi_decode_rejects_truncated_buffer() {
        let value = rsa::BigUint::from(65537u32);
        let encoded = to_mpi(&value);
        assert!(from_mpi(&encoded[..encoded.len() - 1]).is_none());
    }

    #[test]
    fn digest_round_trips_through_pem_save_load() {
        let key = test_key();
        let pem = rsa::pkcs1::EncodeRsaPublicKey::to_pkcs1_pem(
            &key,
            rsa::pkcs1::LineEnding::LF,
        )
        .expect("encode pem");
        let reloaded = RsaPublicKey::from_pkcs1_pem(&pem).expect("decode pem");
        assert_eq!(peer_digest(&key), peer_digest(&reloaded));
    }
}
