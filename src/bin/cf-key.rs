// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `cf-key`: key-pair generation and lastseen/keystore maintenance (§6).

use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::Parser;
use cfprotocol::{
    crypto::{digest::peer_digest, keys::RsaKeyPair},
    keystore::KeyStore,
    lastseen::LastSeenStore,
};
use rand::RngCore as _;
use rsa::{RsaPublicKey, pkcs1::DecodeRsaPublicKey as _};
use tracing::Level;

const DEFAULT_WORKDIR: &str = "/var/cfengine";
const LASTSEEN_FORGET_RATE: f64 = 0.6;

#[derive(Parser, Debug)]
#[command(name = "cf-key", version, about = "Generate and manage cfprotocol RSA key material")]
struct Cli {
    /// Enable debug output.
    #[arg(long)]
    debug: bool,

    /// Enable verbose output.
    #[arg(long)]
    verbose: bool,

    /// Use P as the base for .priv/.pub file names instead of
    /// `<workdir>/ppkeys/localhost`.
    #[arg(long, value_name = "P")]
    output_file: Option<PathBuf>,

    /// Print the lastseen table, tab-aligned.
    #[arg(long)]
    show_hosts: bool,

    /// Remove keys and lastseen entries for host H (IP or digest).
    #[arg(long, value_name = "H")]
    remove_keys: Option<String>,

    /// Print the canonical digest of the public key at P.
    #[arg(long, value_name = "P")]
    print_digest: Option<PathBuf>,
}

fn work_dir() -> PathBuf {
    std::env::var("CFENGINE_WORKDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_WORKDIR))
}

fn init_tracing(cli: &Cli) {
    let level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else {
        Level::WARN
    };
    let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    let outcome = if let Some(path) = &cli.print_digest {
        print_digest(path)
    } else if cli.show_hosts {
        show_hosts()
    } else if let Some(host) = &cli.remove_keys {
        remove_keys(host)
    } else {
        generate_keys(cli.output_file.as_deref())
    };

    match outcome {
        Ok(true) => ExitCode::from(0),
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("cf-key: {e:#}");
            ExitCode::from(255)
        }
    }
}

/// Returns `Ok(true)` for plain success, `Ok(false)` for an "expected
/// failure" per §6 (not found, nothing removed).
fn print_digest(path: &Path) -> Result<bool> {
    let pem = fs::read_to_string(path)
        .with_context(|| format!("reading public key file {path:?}"))?;
    let key = RsaPublicKey::from_pkcs1_pem(&pem)
        .with_context(|| format!("parsing public key PEM at {path:?}"))?;
    println!("{}", peer_digest(&key));
    Ok(true)
}

fn show_hosts() -> Result<bool> {
    let workdir = work_dir();
    let lastseen_path = workdir.join("state/cf_lastseen.lmdb");
    if !lastseen_path.exists() {
        eprintln!("cf-key: no lastseen store at {lastseen_path:?}");
        return Ok(false);
    }

    let store = LastSeenStore::open(&lastseen_path, LASTSEEN_FORGET_RATE)
        .with_context(|| format!("opening lastseen store at {lastseen_path:?}"))?;

    println!("Direction\tDigest\tAddress\tMean-Interval\tLast-Seen");
    let mut count = 0usize;
    store.scan(|digest, address, incoming, quality| {
        count += 1;
        println!(
            "{}\t{digest}\t{address}\t{:.1}\t-",
            if incoming { "accept" } else { "connect" },
            quality.q_mean
        );
        true
    })?;

    println!("--");
    println!("Total hosts: {} (tracked keys: {})", count, store.host_key_count()?);
    Ok(true)
}

fn remove_keys(host: &str) -> Result<bool> {
    let workdir = work_dir();
    let keystore = KeyStore::new(workdir.join("ppkeys"));
    let lastseen_path = workdir.join("state/cf_lastseen.lmdb");

    let removed_keys = keystore
        .remove_public_key(host)
        .with_context(|| format!("removing public keys matching {host:?}"))?;

    let removed_lastseen = if lastseen_path.exists() {
        let store = LastSeenStore::open(&lastseen_path, LASTSEEN_FORGET_RATE)
            .with_context(|| format!("opening lastseen store at {lastseen_path:?}"))?;
        store
            .remove_host(host)
            .with_context(|| format!("removing lastseen entries for {host:?}"))?
    } else {
        0
    };

    if removed_keys == 0 && removed_lastseen == 0 {
        eprintln!("cf-key: no keys or lastseen entries matched {host:?}");
        return Ok(false);
    }

    println!("Removed {removed_keys} key(s), {removed_lastseen} lastseen entr(y/ies) for {host:?}");
    Ok(true)
}

fn generate_keys(output_file: Option<&Path>) -> Result<bool> {
    let workdir = work_dir();
    let base = output_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| workdir.join("ppkeys/localhost"));

    let priv_path = PathBuf::from(format!("{}.priv", base.display()));
    let pub_path = PathBuf::from(format!("{}.pub", base.display()));

    if priv_path.exists() || pub_path.exists() {
        eprintln!(
            "cf-key: key material already exists at {}.{{priv,pub}}, leaving it in place",
            base.display()
        );
        return Ok(false);
    }

    let keys = RsaKeyPair::generate().context("generating RSA key pair")?;
    keys.save(&priv_path, &pub_path)
        .context("saving generated key pair")?;

    let randseed_path = workdir.join("state/randseed");
    if let Some(parent) = randseed_path.parent() {
        fs::create_dir_all(parent).context("creating state directory")?;
    }
    let mut seed = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    fs::write(&randseed_path, seed).context("writing randseed file")?;

    println!("Generated key pair: {}.priv, {}.pub", base.display(), base.display());
    Ok(true)
}
