// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Crypto primitives (§4.B): RSA key load/save, session-key derivation,
//! symmetric cipher init, and message digest.

pub mod cipher;
pub mod digest;
pub mod keys;

pub use cipher::{CipherError, SessionKey, decrypt_block, encrypt_block};
pub use digest::{from_mpi, peer_digest, peer_digest_legacy, to_mpi};
pub use keys::RsaKeyPair;
