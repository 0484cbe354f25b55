// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `cf-serverd`: the protocol daemon. Accepts connections and hands each
//! one to [`protocol::connection::run_connection`].

use std::{
    collections::HashMap,
    process::ExitCode,
    sync::{Arc, atomic::AtomicBool},
};

use anyhow::{Context, Result};
use clap::Parser;
use cfprotocol::{
    access::RuleSet,
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    crypto::keys::RsaKeyPair,
    keystore::KeyStore,
    lastseen::LastSeenStore,
    protocol::connection::{ServerContext, run_connection},
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "cf-serverd", version, about = "cfprotocol server daemon")]
struct Cli {
    /// Path to the YAML server configuration.
    #[arg(long)]
    config: String,

    /// Path to the YAML logging configuration. Falls back to a plain
    /// stderr subscriber when omitted.
    #[arg(long)]
    log_config: Option<String>,

    /// Enable debug output (only used when `--log-config` is absent).
    #[arg(long)]
    debug: bool,

    /// Enable verbose output (only used when `--log-config` is absent).
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match &cli.log_config {
        Some(path) => match init_logger(path) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("cf-serverd: failed to initialize logger: {e:#}");
                None
            }
        },
        None => {
            let level = if cli.debug {
                tracing::Level::DEBUG
            } else if cli.verbose {
                tracing::Level::INFO
            } else {
                tracing::Level::WARN
            };
            let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
            None
        }
    };

    match run(&cli).await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(255)
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config_path = resolve_config_path(&cli.config).context("resolving --config path")?;
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("loading configuration from {config_path:?}"))?;

    let keystore = KeyStore::new(config.keys.ppkeys_dir());
    let keypair = RsaKeyPair::load_or_generate(
        &config.keys.private_key_path(),
        &config.keys.public_key_path(),
    )
    .context("loading or generating the server key pair")?;
    let lastseen = LastSeenStore::open(&config.keys.lastseen_path(), config.lastseen.forget_rate)
        .context("opening the lastseen store")?;
    let rules = RuleSet::load_from_file(&config.access.rules_file)
        .with_context(|| format!("loading access rules from {}", config.access.rules_file))?;

    let bind_addr = format!(
        "{}:{}",
        if config.network.bind_address.is_empty() {
            "0.0.0.0"
        } else {
            &config.network.bind_address
        },
        config.network.port
    );
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(%bind_addr, "cf-serverd listening");

    let ctx = Arc::new(ServerContext {
        config,
        keystore,
        lastseen,
        rules,
        keypair,
        literals: HashMap::new(),
        persistent_classes: Vec::new(),
        pending_termination: Arc::new(AtomicBool::new(false)),
    });

    {
        let flag = Arc::clone(&ctx.pending_termination);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received shutdown signal, finishing in-flight commands");
                flag.store(true, std::sync::atomic::Ordering::Relaxed);
            }
        });
    }

    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                match ctx.lastseen.purge_older_than(ctx.config.lastseen.horizon_days) {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "lastseen horizon GC"),
                    Err(e) => warn!(error = %e, "lastseen horizon GC failed"),
                }
            }
        });
    }

    loop {
        if ctx.pending_termination.load(std::sync::atomic::Ordering::Relaxed) {
            info!("shutting down, no longer accepting new connections");
            return Ok(());
        }
        let (mut socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        let ctx = Arc::clone(&ctx);

        tokio::spawn(async move {
            info!(%peer_addr, "connection accepted");
            if let Err(e) = run_connection(&mut socket, peer_addr.ip(), &ctx).await {
                if e.closes_connection() {
                    warn!(%peer_addr, error = %e, "connection closed");
                } else {
                    info!(%peer_addr, error = %e, "command failed, connection stays open");
                }
            }
        });
    }
}
