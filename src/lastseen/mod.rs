// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Lastseen store (§4.D): bidirectional peer-observation log with rolling
//! quality statistics, backed by `sled`. Grounded in
//! `libpromises/lastseen.h`'s `LastSaw`/`ScanLastSeenQuality`/
//! `IsLastSeenCoherent`/`RemoveKeysFromLastSeen`/`LastSeenHostKeyCount`
//! contract; the coherence invariant this module enforces is "for every
//! accepted digest there is exactly one address, and vice versa".

use std::{
    net::IpAddr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    cfg::enums::LastSeenRole,
    error::{ProtocolError, Result},
};

/// Exponentially-weighted quality sample for a peer, mirroring `QPoint` /
/// `KeyHostSeen` from the original lastseen tracker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Quality {
    /// Rolling mean inter-observation interval, seconds.
    pub q_mean: f64,
    /// Rolling variance of the inter-observation interval.
    pub q_var: f64,
    /// Number of observations folded into this record.
    pub samples: u64,
}

impl Quality {
    fn first(interval: f64) -> Self {
        Self { q_mean: interval, q_var: 0.0, samples: 1 }
    }

    /// Folds a new observation in with forget-rate `alpha`: `new = alpha *
    /// previous + (1 - alpha) * current`, applied to both mean and
    /// variance (§4.D).
    fn update(self, interval: f64, alpha: f64) -> Self {
        let delta = interval - self.q_mean;
        let q_mean = alpha * self.q_mean + (1.0 - alpha) * interval;
        let q_var = alpha * self.q_var + (1.0 - alpha) * delta * delta;
        Self { q_mean, q_var, samples: self.samples + 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    lastseen_epoch_secs: u64,
    quality: Quality,
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn entry_key(role: LastSeenRole, digest: &str) -> Vec<u8> {
    let mut key = vec![role.prefix()];
    key.extend_from_slice(digest.as_bytes());
    key
}

pub struct LastSeenStore {
    entries: sled::Tree,
    addr_to_digest: sled::Tree,
    digest_to_addr: sled::Tree,
    forget_rate: f64,
}

impl LastSeenStore {
    pub fn open(path: &std::path::Path, forget_rate: f64) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| ProtocolError::Fatal(format!("opening lastseen store {path:?}: {e}")))?;
        let entries = db
            .open_tree("entries")
            .map_err(|e| ProtocolError::Fatal(format!("opening entries tree: {e}")))?;
        let addr_to_digest = db
            .open_tree("addr_to_digest")
            .map_err(|e| ProtocolError::Fatal(format!("opening addr_to_digest tree: {e}")))?;
        let digest_to_addr = db
            .open_tree("digest_to_addr")
            .map_err(|e| ProtocolError::Fatal(format!("opening digest_to_addr tree: {e}")))?;
        Ok(Self { entries, addr_to_digest, digest_to_addr, forget_rate })
    }

    /// `last-saw(ip, digest, role)`: updates the entry and both indices
    /// atomically relative to each other (best-effort: `sled` gives us
    /// per-tree atomicity, which is sufficient here since all three writes
    /// derive from the same observation and a crash between them just
    /// leaves a record `is_coherent` will flag on the next scan).
    pub fn last_saw(&self, ip: IpAddr, digest: &str, role: LastSeenRole) -> Result<()> {
        let key = entry_key(role, digest);
        let now = now_epoch_secs();

        let existing = self
            .entries
            .get(&key)
            .map_err(|e| ProtocolError::Fatal(format!("reading lastseen entry: {e}")))?;

        let quality = match existing {
            Some(bytes) => {
                let prev: Entry = serde_json::from_slice(&bytes).map_err(|e| {
                    ProtocolError::Fatal(format!("corrupt lastseen entry: {e}"))
                })?;
                let interval = now.saturating_sub(prev.lastseen_epoch_secs) as f64;
                prev.quality.update(interval, self.forget_rate)
            }
            None => Quality::first(0.0),
        };

        let entry = Entry { lastseen_epoch_secs: now, quality };
        let encoded = serde_json::to_vec(&entry)
            .map_err(|e| ProtocolError::Fatal(format!("encoding lastseen entry: {e}")))?;

        self.entries
            .insert(&key, encoded)
            .map_err(|e| ProtocolError::Fatal(format!("writing lastseen entry: {e}")))?;
        self.addr_to_digest
            .insert(ip.to_string().as_bytes(), digest.as_bytes())
            .map_err(|e| ProtocolError::Fatal(format!("writing addr_to_digest: {e}")))?;
        self.digest_to_addr
            .insert(digest.as_bytes(), ip.to_string().as_bytes())
            .map_err(|e| ProtocolError::Fatal(format!("writing digest_to_addr: {e}")))?;
        Ok(())
    }

    pub fn address_to_digest(&self, ip: IpAddr) -> Result<Option<String>> {
        let v = self
            .addr_to_digest
            .get(ip.to_string().as_bytes())
            .map_err(|e| ProtocolError::Fatal(format!("reading addr_to_digest: {e}")))?;
        Ok(v.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    pub fn digest_to_address(&self, digest: &str) -> Result<Option<String>> {
        let v = self
            .digest_to_addr
            .get(digest.as_bytes())
            .map_err(|e| ProtocolError::Fatal(format!("reading digest_to_addr: {e}")))?;
        Ok(v.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// `scan(callback)`: iterates all entries, calling `callback` with
    /// `(hostkey, address, incoming, quality)`; returning `false` stops
    /// iteration early.
    pub fn scan<F>(&self, mut callback: F) -> Result<()>
    where F: FnMut(&str, &str, bool, &Quality) -> bool {
        for item in self.entries.iter() {
            let (key, value) =
                item.map_err(|e| ProtocolError::Fatal(format!("iterating entries: {e}")))?;
            if key.is_empty() {
                continue;
            }
            let incoming = key[0] == LastSeenRole::Accept.prefix();
            let digest = String::from_utf8_lossy(&key[1..]).into_owned();
            let entry: Entry = serde_json::from_slice(&value)
                .map_err(|e| ProtocolError::Fatal(format!("corrupt lastseen entry: {e}")))?;
            let address = self.digest_to_address(&digest)?.unwrap_or_default();

            if !callback(&digest, &address, incoming, &entry.quality) {
                break;
            }
        }
        Ok(())
    }

    /// `remove-host(key)`: `key` is an IP or a digest; removes all
    /// coherent records (both index directions, both role-prefixed
    /// entries).
    pub fn remove_host(&self, key: &str) -> Result<usize> {
        let digest = if self.digest_to_addr.contains_key(key.as_bytes()).unwrap_or(false) {
            Some(key.to_string())
        } else {
            self.addr_to_digest
                .get(key.as_bytes())
                .ok()
                .flatten()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
        };

        let Some(digest) = digest else { return Ok(0) };
        let address = self.digest_to_address(&digest)?;

        let mut removed = 0usize;
        for role in [LastSeenRole::Connect, LastSeenRole::Accept] {
            if self
                .entries
                .remove(entry_key(role, &digest))
                .map_err(|e| ProtocolError::Fatal(format!("removing entry: {e}")))?
                .is_some()
            {
                removed += 1;
            }
        }
        self.digest_to_addr
            .remove(digest.as_bytes())
            .map_err(|e| ProtocolError::Fatal(format!("removing digest_to_addr: {e}")))?;
        if let Some(address) = address {
            self.addr_to_digest
                .remove(address.as_bytes())
                .map_err(|e| ProtocolError::Fatal(format!("removing addr_to_digest: {e}")))?;
        }
        Ok(removed)
    }

    /// `is-coherent()`: every digest-to-address mapping must have a
    /// reciprocal address-to-digest mapping. Repair is advisory only —
    /// this only reports, via `tracing::warn!`, never mutates.
    pub fn is_coherent(&self) -> Result<bool> {
        let mut coherent = true;
        for item in self.digest_to_addr.iter() {
            let (digest, address) =
                item.map_err(|e| ProtocolError::Fatal(format!("iterating digest_to_addr: {e}")))?;
            let digest = String::from_utf8_lossy(&digest).into_owned();
            let address = String::from_utf8_lossy(&address).into_owned();

            match self
                .addr_to_digest
                .get(address.as_bytes())
                .map_err(|e| ProtocolError::Fatal(format!("reading addr_to_digest: {e}")))?
            {
                Some(back) if back.as_ref() == digest.as_bytes() => {}
                _ => {
                    warn!(%digest, %address, "lastseen store incoherent: missing reciprocal index");
                    coherent = false;
                }
            }
        }
        Ok(coherent)
    }

    /// `LastSeenHostKeyCount`-equivalent (§10 supplement): number of
    /// distinct digests with at least one recorded entry.
    pub fn host_key_count(&self) -> Result<usize> {
        Ok(self
            .digest_to_addr
            .len())
    }

    /// Garbage-collects entries whose most recent observation is older
    /// than `horizon_days`, dropping both role-prefixed entries and both
    /// index directions via [`Self::remove_host`].
    pub fn purge_older_than(&self, horizon_days: u64) -> Result<usize> {
        let cutoff = now_epoch_secs().saturating_sub(horizon_days.saturating_mul(86_400));
        let mut stale_digests = std::collections::HashSet::new();

        for item in self.entries.iter() {
            let (key, value) =
                item.map_err(|e| ProtocolError::Fatal(format!("iterating entries: {e}")))?;
            if key.is_empty() {
                continue;
            }
            let entry: Entry = serde_json::from_slice(&value)
                .map_err(|e| ProtocolError::Fatal(format!("corrupt lastseen entry: {e}")))?;
            if entry.lastseen_epoch_secs < cutoff {
                stale_digests.insert(String::from_utf8_lossy(&key[1..]).into_owned());
            }
        }

        let mut removed = 0usize;
        for digest in stale_digests {
            removed += self.remove_host(&digest)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LastSeenStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LastSeenStore::open(&dir.path().join("lastseen.sled"), 0.6).expect("open");
        (dir, store)
    }

    #[test]
    fn last_saw_updates_both_indices() {
        let (_dir, store) = store();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        store.last_saw(ip, "abc123", LastSeenRole::Accept).expect("last_saw");

        assert_eq!(store.address_to_digest(ip).unwrap().as_deref(), Some("abc123"));
        assert_eq!(store.digest_to_address("abc123").unwrap().as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn repeated_observations_update_quality() {
        let (_dir, store) = store();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        store.last_saw(ip, "abc123", LastSeenRole::Connect).expect("first");
        store.last_saw(ip, "abc123", LastSeenRole::Connect).expect("second");

        let mut seen = Vec::new();
        store
            .scan(|digest, _addr, _incoming, q| {
                seen.push((digest.to_string(), q.samples));
                true
            })
            .expect("scan");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, 2);
    }

    #[test]
    fn remove_host_by_digest_clears_reciprocal_index() {
        let (_dir, store) = store();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        store.last_saw(ip, "abc123", LastSeenRole::Accept).expect("last_saw");

        let removed = store.remove_host("abc123").expect("remove");
        assert_eq!(removed, 1);
        assert!(store.address_to_digest(ip).unwrap().is_none());
        assert!(store.digest_to_address("abc123").unwrap().is_none());
    }

    #[test]
    fn remove_host_by_address_also_works() {
        let (_dir, store) = store();
        let ip: IpAddr = "10.0.0.6".parse().unwrap();
        store.last_saw(ip, "def456", LastSeenRole::Connect).expect("last_saw");

        let removed = store.remove_host("10.0.0.6").expect("remove");
        assert_eq!(removed, 1);
    }

    #[test]
    fn fresh_store_is_coherent() {
        let (_dir, store) = store();
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        store.last_saw(ip, "ghi789", LastSeenRole::Accept).expect("last_saw");
        assert!(store.is_coherent().expect("coherence check"));
    }

    #[test]
    fn purge_older_than_leaves_recent_entries_alone() {
        let (_dir, store) = store();
        store
            .last_saw("10.0.0.9".parse().unwrap(), "fresh", LastSeenRole::Accept)
            .unwrap();

        let removed = store.purge_older_than(30).expect("purge");
        assert_eq!(removed, 0);
        assert!(store.digest_to_address("fresh").unwrap().is_some());
    }

    #[test]
    fn purge_older_than_removes_stale_entries() {
        let (_dir, store) = store();
        let ip: IpAddr = "10.0.0.10".parse().unwrap();
        store.last_saw(ip, "stale", LastSeenRole::Accept).expect("last_saw");

        let key = entry_key(LastSeenRole::Accept, "stale");
        let mut entry: Entry =
            serde_json::from_slice(&store.entries.get(&key).unwrap().unwrap()).unwrap();
        entry.lastseen_epoch_secs = 0;
        store
            .entries
            .insert(key, serde_json::to_vec(&entry).unwrap())
            .unwrap();

        let removed = store.purge_older_than(30).expect("purge");
        assert_eq!(removed, 1);
        assert!(store.digest_to_address("stale").unwrap().is_none());
    }

    #[test]
    fn host_key_count_reflects_distinct_digests() {
        let (_dir, store) = store();
        store
            .last_saw("10.0.0.1".parse().unwrap(), "k1", LastSeenRole::Accept)
            .unwrap();
        store
            .last_saw("10.0.0.2".parse().unwrap(), "k2", LastSeenRole::Connect)
            .unwrap();
        assert_eq!(store.host_key_count().unwrap(), 2);
    }
}
