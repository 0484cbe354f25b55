// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::Path,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use anyhow::Result;
use cfprotocol::{
    access::{PathRule, RuleSet, TwoList},
    auth::client::run_client_handshake,
    cfg::{
        config::{
            AccessConfig, Config, KeyConfig, LastseenConfig, NetworkConfig, RuntimeConfig,
            TrustConfig,
        },
        enums::CipherFamily,
    },
    crypto::{cipher::SessionKey, keys::RsaKeyPair},
    keystore::KeyStore,
    lastseen::LastSeenStore,
    protocol::connection::{run_connection, ServerContext},
    wire::{send_frame, FrameStatus},
};
use tokio::net::{TcpListener, TcpStream};

pub fn test_config(workdir: &Path) -> Config {
    Config {
        network: NetworkConfig {
            bind_address: String::new(),
            port: 0,
            connect_timeout: Duration::from_secs(2),
            receive_timeout: Duration::from_secs(2),
        },
        keys: KeyConfig {
            work_dir: workdir.to_string_lossy().into_owned(),
            private_key_file: "ppkeys/localhost.priv".to_string(),
            public_key_file: "ppkeys/localhost.pub".to_string(),
            randseed_file: "state/randseed".to_string(),
        },
        trust: TrustConfig { trust_keys_from: vec!["127.*".to_string()] },
        access: AccessConfig {
            rules_file: "unused.yaml".to_string(),
            deny_bad_clocks: true,
            clock_skew_threshold: Duration::from_secs(900),
        },
        lastseen: LastseenConfig { forget_rate: 0.6, horizon_days: 30 },
        runtime: RuntimeConfig { max_background_workers: 50, maproot_hosts: vec![] },
    }
}

/// Admits everything under `root`, matching the shape a deployment's
/// access-rules YAML would produce for a single served tree.
pub fn permissive_path_rules(root: &str) -> RuleSet {
    RuleSet {
        path: TwoList {
            admit: vec![PathRule {
                pattern: root.to_string(),
                encrypt_required: false,
                maproot: vec![],
            }],
            deny: vec![],
        },
        ..Default::default()
    }
}

/// Binds a loopback listener running the full connection driver with
/// `rules`, and keeps accepting connections until the test process exits.
pub async fn spawn_server(workdir: &Path, rules: RuleSet) -> Result<SocketAddr> {
    let config = test_config(workdir);

    let keystore = KeyStore::new(config.keys.ppkeys_dir());
    let keypair = RsaKeyPair::load_or_generate(
        &config.keys.private_key_path(),
        &config.keys.public_key_path(),
    )?;
    let lastseen =
        LastSeenStore::open(&config.keys.lastseen_path(), config.lastseen.forget_rate)?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let ctx = Arc::new(ServerContext {
        config,
        keystore,
        lastseen,
        rules,
        keypair,
        literals: HashMap::from([("test_var".to_string(), "test_value".to_string())]),
        persistent_classes: vec!["linux_test".to_string()],
        pending_termination: Arc::new(AtomicBool::new(false)),
    });

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, peer_addr)) = listener.accept().await else {
                break;
            };
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                let _ = run_connection(&mut socket, peer_addr.ip(), &ctx).await;
            });
        }
    });

    Ok(addr)
}

/// Connects to `addr`, sends `CAUTH`, and runs the client side of `SAUTH`
/// against a throwaway key pair, returning the authenticated stream and
/// its negotiated session key.
pub async fn connect_and_auth(addr: SocketAddr, username: &str) -> Result<(TcpStream, SessionKey)> {
    let timeout = Duration::from_secs(2);
    let mut stream = TcpStream::connect(addr).await?;
    let local_ip = stream.local_addr()?.ip();

    let cauth = format!("CAUTH {local_ip} - {username} 0");
    send_frame(&mut stream, cauth.as_bytes(), FrameStatus::Done, timeout).await?;

    let client_keys = RsaKeyPair::generate()?;
    let outcome = run_client_handshake(
        &mut stream,
        &client_keys.private,
        &client_keys.public,
        None,
        CipherFamily::Aes128,
        timeout,
    )
    .await?;

    Ok((stream, outcome.session_key))
}
