// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Key store (§4.C): filesystem-backed trust store of peer public keys,
//! keyed by `(username, digest)` and named `<user>-<digest>.pub` under
//! `ppkeys/`, mirroring `HavePublicKey`/`SavePublicKey`/`TrustKey` from
//! `libpromises/crypto.h`.

use std::{
    net::IpAddr,
    path::{Path, PathBuf},
};

use rsa::{
    RsaPublicKey,
    pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey, LineEnding},
};
use tracing::{info, warn};

use crate::{
    cfg::config::TrustConfig,
    crypto::{keys::write_atomic_0600, peer_digest},
    error::{ProtocolError, Result},
};

pub struct KeyStore {
    ppkeys_dir: PathBuf,
}

impl KeyStore {
    pub fn new(ppkeys_dir: impl Into<PathBuf>) -> Self {
        Self { ppkeys_dir: ppkeys_dir.into() }
    }

    fn key_path(&self, username: &str, digest: &str) -> PathBuf {
        self.ppkeys_dir.join(format!("{username}-{digest}.pub"))
    }

    /// `have_public_key(username, ip, digest) -> key | none`. `ip` is
    /// accepted but unused for the filesystem lookup itself (kept in the
    /// signature to match §4.C — some callers resolve legacy
    /// `<ip>.pub`-named keys, which we don't carry forward).
    pub fn have_public_key(
        &self,
        username: &str,
        _ip: IpAddr,
        digest: &str,
    ) -> Result<Option<RsaPublicKey>> {
        let path = self.key_path(username, digest);
        if !path.exists() {
            return Ok(None);
        }
        let pem = std::fs::read_to_string(&path)
            .map_err(|e| ProtocolError::Fatal(format!("reading {path:?}: {e}")))?;
        let key = RsaPublicKey::from_pkcs1_pem(&pem)
            .map_err(|e| ProtocolError::Fatal(format!("parsing {path:?}: {e}")))?;
        Ok(Some(key))
    }

    /// `save_public_key(username, digest, key) -> ok | error`.
    pub fn save_public_key(
        &self,
        username: &str,
        digest: &str,
        key: &RsaPublicKey,
    ) -> Result<()> {
        let path = self.key_path(username, digest);
        let pem = key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| ProtocolError::Fatal(format!("encoding key: {e}")))?;
        write_atomic_0600(&path, pem.as_bytes())?;
        info!(username, digest, "saved trusted public key");
        Ok(())
    }

    /// `remove_public_key(id) -> count | error`, where `id` is matched
    /// against the filename as an IP or a digest suffix.
    pub fn remove_public_key(&self, id: &str) -> Result<usize> {
        let mut removed = 0usize;
        let entries = std::fs::read_dir(&self.ppkeys_dir)
            .map_err(|e| ProtocolError::Fatal(format!("reading {:?}: {e}", self.ppkeys_dir)))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| ProtocolError::Fatal(format!("listing ppkeys dir: {e}")))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(".pub") {
                continue;
            }
            if name.contains(id) {
                std::fs::remove_file(entry.path())
                    .map_err(|e| ProtocolError::Fatal(format!("removing {name}: {e}")))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Trust-on-first-use decision for an unknown key (§4.C "Trust
    /// decision"): accepted only if the peer address matches the
    /// configured `trust-keys-from` allowlist.
    pub fn decide_trust(&self, trust: &TrustConfig, peer_ip: IpAddr) -> Result<()> {
        if trust.trusts(peer_ip) {
            Ok(())
        } else {
            warn!(%peer_ip, "refusing unknown key: not in trust-keys-from");
            Err(ProtocolError::AuthFailure(format!(
                "untrusted-key: {peer_ip} not in trust-keys-from"
            )))
        }
    }

    /// Accepts a never-before-seen key from `peer_ip` under TOFU policy,
    /// persisting it on success.
    pub fn trust_and_save(
        &self,
        trust: &TrustConfig,
        username: &str,
        peer_ip: IpAddr,
        key: &RsaPublicKey,
    ) -> Result<String> {
        self.decide_trust(trust, peer_ip)?;
        let digest = peer_digest(key);
        self.save_public_key(username, &digest, key)?;
        Ok(digest)
    }

    pub fn ppkeys_dir(&self) -> &Path {
        &self.ppkeys_dir
    }

    /// Loads whatever key is already on file for `username`, regardless of
    /// digest. Used by the client side of the handshake to decide whether
    /// it already trusts a server by name before it knows that server's
    /// digest (§4.C / §4.E "known_server_key").
    pub fn find_any_for_user(&self, username: &str) -> Result<Option<RsaPublicKey>> {
        let prefix = format!("{username}-");
        let entries = std::fs::read_dir(&self.ppkeys_dir)
            .map_err(|e| ProtocolError::Fatal(format!("reading {:?}: {e}", self.ppkeys_dir)))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| ProtocolError::Fatal(format!("listing ppkeys dir: {e}")))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".pub") {
                let pem = std::fs::read_to_string(entry.path())
                    .map_err(|e| ProtocolError::Fatal(format!("reading {name}: {e}")))?;
                let key = RsaPublicKey::from_pkcs1_pem(&pem)
                    .map_err(|e| ProtocolError::Fatal(format!("parsing {name}: {e}")))?;
                return Ok(Some(key));
            }
        }
        Ok(None)
    }
}
