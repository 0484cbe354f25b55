// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `cf-runagent`: client binary driving a single request (`GET`, `EXEC`,
//! `OPENDIR`, …) against a `cf-serverd` peer.

use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Parser;
use cfprotocol::{
    auth::client::run_client_handshake,
    cfg::{cli::resolve_config_path, config::Config, enums::CipherFamily},
    crypto::keys::RsaKeyPair,
    keystore::KeyStore,
    lastseen::LastSeenStore,
    services::receive_opendir,
    transfer::receive_file,
    wire::{FrameStatus, recv_frame, send_frame},
};
use tokio::{io::AsyncWriteExt as _, net::TcpStream};
use tracing::{Level, info};

#[derive(Parser, Debug)]
#[command(name = "cf-runagent", version, about = "cfprotocol client agent")]
struct Cli {
    /// Path to the YAML client configuration (key paths, trust list).
    #[arg(long)]
    config: String,

    /// Enable debug output.
    #[arg(long)]
    debug: bool,

    /// Enable verbose output.
    #[arg(long)]
    verbose: bool,

    /// Server host:port to connect to.
    #[arg(long)]
    server: String,

    /// Local username presented in CAUTH.
    #[arg(long, default_value = "root")]
    username: String,

    #[command(subcommand)]
    command: AgentCommand,
}

#[derive(clap::Subcommand, Debug)]
enum AgentCommand {
    /// Fetch a remote file to a local destination.
    Get {
        remote_path: String,
        #[arg(long)]
        dest: PathBuf,
        #[arg(long, default_value_t = false)]
        encrypted: bool,
    },
    /// List a remote directory.
    OpenDir {
        remote_path: String,
    },
    /// Execute a remote command and print its output.
    Exec {
        remote_args: String,
    },
    /// Print the remote server's protocol version.
    Version,
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

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(&cli).await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            eprintln!("cf-runagent: {e:#}");
            ExitCode::from(255)
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config_path = resolve_config_path(&cli.config).context("resolving --config path")?;
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("loading configuration from {config_path:?}"))?;

    let keypair = RsaKeyPair::load_or_generate(
        &config.keys.private_key_path(),
        &config.keys.public_key_path(),
    )
    .context("loading or generating the local key pair")?;

    let mut stream = TcpStream::connect(&cli.server)
        .await
        .with_context(|| format!("connecting to {}", cli.server))?;
    let local_addr = stream.local_addr().context("reading local socket address")?;
    let timeout = config.network.receive_timeout;

    let cauth_line = format!("CAUTH {} - {} 0", local_addr.ip(), cli.username);
    send_frame(&mut stream, cauth_line.as_bytes(), FrameStatus::Done, timeout)
        .await
        .context("sending CAUTH")?;

    let server_ip = stream.peer_addr().context("reading peer address")?.ip();

    let keystore = KeyStore::new(config.keys.ppkeys_dir());
    let known_server_key = keystore
        .find_any_for_user(&cli.username)
        .context("checking the local keystore")?;

    let outcome = run_client_handshake(
        &mut stream,
        &keypair.private,
        &keypair.public,
        known_server_key.as_ref(),
        CipherFamily::Aes128,
        timeout,
    )
    .await
    .context("SAUTH handshake failed")?;

    if known_server_key.is_none() {
        keystore
            .trust_and_save(&config.trust, &cli.username, server_ip, &outcome.peer_public_key)
            .context("evaluating server trust")?;
    }

    let lastseen = LastSeenStore::open(&config.keys.lastseen_path(), config.lastseen.forget_rate)
        .context("opening the lastseen store")?;
    lastseen
        .last_saw(server_ip, &outcome.peer_digest, cfprotocol::cfg::enums::LastSeenRole::Connect)
        .context("recording lastseen observation")?;

    info!(peer_digest = %outcome.peer_digest, "SAUTH complete");

    match &cli.command {
        AgentCommand::Version => {
            send_frame(&mut stream, b"VERSION", FrameStatus::Done, timeout).await?;
            let frame = recv_frame(&mut stream, timeout).await?;
            println!("{}", String::from_utf8_lossy(&frame.payload));
        }

        AgentCommand::Get { remote_path, dest, encrypted } => {
            let line = if *encrypted {
                bail!("encrypted GET (SGET) requires an inline request encoder not wired into this CLI yet");
            } else {
                format!("GET 2048 {remote_path}")
            };
            send_frame(&mut stream, line.as_bytes(), FrameStatus::Done, timeout).await?;
            let total = receive_file(&mut stream, dest, None, timeout)
                .await
                .context("receiving file")?;
            println!("received {total} bytes into {}", dest.display());
        }

        AgentCommand::OpenDir { remote_path } => {
            send_frame(&mut stream, format!("OPENDIR {remote_path}").as_bytes(), FrameStatus::Done, timeout)
                .await?;
            let names = receive_opendir(&mut stream, timeout).await.context("listing directory")?;
            for name in names {
                println!("{name}");
            }
        }

        AgentCommand::Exec { remote_args } => {
            send_frame(&mut stream, format!("EXEC {remote_args}").as_bytes(), FrameStatus::Done, timeout)
                .await?;
            let stdout = recv_frame(&mut stream, timeout).await?;
            tokio::io::stdout().write_all(&stdout.payload).await.ok();
            if stdout.status == FrameStatus::More {
                let stderr = recv_frame(&mut stream, timeout).await?;
                tokio::io::stderr().write_all(&stderr.payload).await.ok();
            }
        }
    }

    Ok(())
}
