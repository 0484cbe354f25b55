// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::IpAddr, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Bind address / port and socket timeouts.
    pub network: NetworkConfig,
    /// Local key-pair and random-seed file locations.
    pub keys: KeyConfig,
    /// Trust-on-first-use allowlist for unknown peer keys.
    pub trust: TrustConfig,
    /// Path access / literal / context rules.
    pub access: AccessConfig,
    /// Lastseen store tuning.
    pub lastseen: LastseenConfig,
    /// Everything that isn't on the wire.
    pub runtime: RuntimeConfig,
}

/// Network-facing parameters: where to listen/connect and how long to wait.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NetworkConfig {
    #[serde(default, rename = "BindAddress")]
    /// Interface to bind to (server only); empty means all interfaces.
    pub bind_address: String,

    #[serde(default = "default_port", rename = "Port")]
    /// TCP port; defaults to the `cfenginehub` service entry's 5308.
    pub port: u16,

    #[serde(rename = "ConnectTimeout", with = "serde_secs")]
    /// Client-side TCP connect timeout.
    pub connect_timeout: Duration,

    #[serde(rename = "ReceiveTimeout", with = "serde_secs")]
    /// Per-socket receive timeout (server default: 5s).
    pub receive_timeout: Duration,
}

fn default_port() -> u16 {
    5308
}

/// Local key material paths, rooted under the working directory's
/// `ppkeys/` subdirectory (§6 persisted state layout).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct KeyConfig {
    #[serde(rename = "WorkDir")]
    /// Working directory; all other paths below are resolved relative to
    /// it unless already absolute.
    pub work_dir: String,

    #[serde(default = "default_private_key", rename = "PrivateKeyFile")]
    pub private_key_file: String,

    #[serde(default = "default_public_key", rename = "PublicKeyFile")]
    pub public_key_file: String,

    #[serde(default = "default_randseed", rename = "RandSeedFile")]
    pub randseed_file: String,
}

fn default_private_key() -> String {
    "ppkeys/localhost.priv".to_string()
}
fn default_public_key() -> String {
    "ppkeys/localhost.pub".to_string()
}
fn default_randseed() -> String {
    "state/randseed".to_string()
}

impl KeyConfig {
    pub fn resolve(&self, rel: &str) -> std::path::PathBuf {
        let p = Path::new(rel);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            Path::new(&self.work_dir).join(p)
        }
    }

    pub fn ppkeys_dir(&self) -> std::path::PathBuf {
        self.resolve("ppkeys")
    }

    pub fn private_key_path(&self) -> std::path::PathBuf {
        self.resolve(&self.private_key_file)
    }

    pub fn public_key_path(&self) -> std::path::PathBuf {
        self.resolve(&self.public_key_file)
    }

    pub fn randseed_path(&self) -> std::path::PathBuf {
        self.resolve(&self.randseed_file)
    }

    pub fn lastseen_path(&self) -> std::path::PathBuf {
        self.resolve("state/cf_lastseen.lmdb")
    }
}

/// Trust-on-first-use allowlist: peer IPs in this list are accepted when
/// they present a key we've never seen before.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct TrustConfig {
    #[serde(default, rename = "TrustKeysFrom")]
    pub trust_keys_from: Vec<String>,
}

impl TrustConfig {
    /// Whether `ip` matches one of the configured trust patterns. Patterns
    /// are either exact addresses or a `prefix.*` glob over the dotted
    /// representation, matching the specification's worked examples
    /// (`10.*`, …).
    pub fn trusts(&self, ip: IpAddr) -> bool {
        let ip_str = ip.to_string();
        self.trust_keys_from
            .iter()
            .any(|pat| ip_pattern_matches(pat, &ip_str))
    }
}

/// Minimal glob matcher for IP allowlist patterns: `*` matches any suffix
/// after a literal prefix.
pub fn ip_pattern_matches(pattern: &str, ip: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => ip.starts_with(prefix),
        None => pattern == ip,
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AccessConfig {
    #[serde(rename = "RulesFile")]
    /// Path to the YAML file containing path/literal/context access rules.
    pub rules_file: String,

    #[serde(default, rename = "DenyBadClocks")]
    /// If set, SYNCH replies `BAD: …` when drift exceeds
    /// `clock_skew_threshold`.
    pub deny_bad_clocks: bool,

    #[serde(default = "default_clock_skew", rename = "ClockSkewThreshold")]
    pub clock_skew_threshold: Duration,
}

fn default_clock_skew() -> Duration {
    Duration::from_secs(900)
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LastseenConfig {
    #[serde(default = "default_alpha", rename = "ForgetRate")]
    /// Exponential-weighting forget rate α used for the rolling quality
    /// statistics (default 0.6 per observation).
    pub forget_rate: f64,

    #[serde(default = "default_horizon", rename = "HorizonDays")]
    /// Entries older than this many days are garbage-collected at scan
    /// time.
    pub horizon_days: u64,
}

fn default_alpha() -> f64 {
    0.6
}
fn default_horizon() -> u64 {
    30
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_background", rename = "MaxBackgroundWorkers")]
    /// Ceiling on forked background (parallel) client workers.
    pub max_background_workers: u32,

    #[serde(default, rename = "MapRoot")]
    /// Hostnames/IPs granted root-privilege mapping when a matching rule
    /// requests it (in addition to per-rule maproot lists).
    pub maproot_hosts: Vec<String>,
}

fn default_max_background() -> u32 {
    50
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.network.port > 0,
            "Port must be a valid non-zero TCP port"
        );
        ensure!(
            self.network.connect_timeout > Duration::ZERO,
            "ConnectTimeout must be > 0"
        );
        ensure!(
            self.network.receive_timeout > Duration::ZERO,
            "ReceiveTimeout must be > 0"
        );
        ensure!(!self.keys.work_dir.is_empty(), "WorkDir must not be empty");
        ensure!(
            self.lastseen.forget_rate > 0.0 && self.lastseen.forget_rate < 1.0,
            "ForgetRate must be in (0, 1)"
        );
        ensure!(
            self.runtime.max_background_workers >= 1,
            "MaxBackgroundWorkers must be >= 1"
        );
        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_pattern_exact_and_glob() {
        assert!(ip_pattern_matches("10.0.0.5", "10.0.0.5"));
        assert!(!ip_pattern_matches("10.0.0.5", "10.0.0.6"));
        assert!(ip_pattern_matches("10.*", "10.1.2.3"));
        assert!(!ip_pattern_matches("10.*", "192.168.0.1"));
    }

    #[test]
    fn trust_config_matches_configured_prefix() {
        let trust = TrustConfig {
            trust_keys_from: vec!["10.*".to_string()],
        };
        assert!(trust.trusts("10.0.0.5".parse().expect("valid ip")));
        assert!(!trust.trusts("192.168.1.1".parse().expect("valid ip")));
    }
}
