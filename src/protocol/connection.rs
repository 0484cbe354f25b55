// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server-side connection driver (§4.G, §5): one task per accepted
//! connection, strictly sequential command processing, no cross-command
//! concurrency on the same socket.

use std::{
    collections::HashMap,
    net::IpAddr,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::{
    access::{self, RuleSet},
    auth::server::{keystore_identity_decision, run_server_handshake},
    cfg::{config::Config, enums::LastSeenRole},
    crypto::{cipher::decrypt_block, keys::RsaKeyPair},
    error::{ProtocolError, Result},
    keystore::KeyStore,
    lastseen::LastSeenStore,
    protocol::{
        ConnectionState, parse_cauth, shortcut_substitute,
        commands::{Command, parse_command},
    },
    services::{digest_differs, send_opendir, stat_path},
    transfer::send_file,
    wire::{FrameStatus, recv_frame, send_frame},
};

/// Everything a connection needs beyond the socket itself: configuration
/// and the three shared stores (§5 "shared-resource policy").
pub struct ServerContext {
    pub config: Config,
    pub keystore: KeyStore,
    pub lastseen: LastSeenStore,
    pub rules: RuleSet,
    pub keypair: RsaKeyPair,
    /// Named literal values served by `VAR`/`SVAR`/`SQUERY`. The wire
    /// protocol's query engine is otherwise out of scope here; this map
    /// is the whole of it.
    pub literals: HashMap<String, String>,
    /// Persistent class names `CONTEXT`/`SCONTEXT` match against.
    pub persistent_classes: Vec<String>,
    /// Server-wide shutdown flag (§5 "Cancellation"): checked at the top
    /// of each command dispatch; once set, every connection closes after
    /// finishing whatever command it's currently on.
    pub pending_termination: Arc<AtomicBool>,
}

async fn recv_line<S: AsyncRead + Unpin>(stream: &mut S, timeout: Duration) -> Result<String> {
    let frame = recv_frame(stream, timeout).await?;
    String::from_utf8(frame.payload)
        .map_err(|e| ProtocolError::ProtocolViolation(format!("non-UTF8 command line: {e}")))
}

async fn send_line<S: AsyncWrite + Unpin>(
    stream: &mut S,
    line: &str,
    timeout: Duration,
) -> Result<()> {
    send_frame(stream, line.as_bytes(), FrameStatus::Done, timeout).await
}

/// Drives one connection through `RAW -> IDENTIFIED -> AUTHENTICATED ->
/// (command loop) -> CLOSED`. Returns once the peer disconnects or a
/// closing-class error occurs; the caller is responsible for tearing down
/// the socket.
pub async fn run_connection<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    peer_ip: IpAddr,
    ctx: &ServerContext,
) -> Result<()> {
    let timeout = ctx.config.network.receive_timeout;
    let mut state = ConnectionState::Raw;

    loop {
        match state {
            ConnectionState::Raw => {
                let line = recv_line(stream, timeout).await?;
                let cauth = parse_cauth(&line)?;
                info!(username = %cauth.username, hostname = %cauth.hostname, %peer_ip, "CAUTH");
                state = ConnectionState::Identified {
                    username: cauth.username,
                    hostname: cauth.hostname,
                };
            }

            ConnectionState::Identified { username, hostname } => {
                let trust = ctx.config.trust.clone();
                let outcome = run_server_handshake(
                    stream,
                    &ctx.keypair.private,
                    &ctx.keypair.public,
                    peer_ip,
                    timeout,
                    |key, digest| {
                        keystore_identity_decision(&ctx.keystore, &username, peer_ip, &trust, key, digest)
                    },
                )
                .await?;

                ctx.lastseen
                    .last_saw(peer_ip, &outcome.peer_digest, LastSeenRole::Accept)?;

                state = ConnectionState::Authenticated {
                    username,
                    hostname,
                    peer_digest: outcome.peer_digest,
                    session_key: Box::new(outcome.session_key),
                };
            }

            ConnectionState::Authenticated { ref username, ref hostname, ref peer_digest, ref session_key } => {
                if ctx.pending_termination.load(Ordering::Relaxed) {
                    info!(%peer_ip, "pending termination, closing connection");
                    return Ok(());
                }

                let line = recv_line(stream, timeout).await?;
                let command = parse_command(&line)?;

                if command.requires_session_key() && state.session_key().is_none() {
                    return Err(ProtocolError::ProtocolViolation(
                        "secure command on an unauthenticated connection".to_string(),
                    ));
                }

                let hostname = hostname.clone();
                let username = username.clone();
                let peer_digest = peer_digest.clone();
                let session_key = (**session_key).clone();

                let outcome = dispatch(
                    stream,
                    ctx,
                    peer_ip,
                    &hostname,
                    &username,
                    &peer_digest,
                    Some(&session_key),
                    command,
                    timeout,
                )
                .await;

                match outcome {
                    Ok(()) => {}
                    Err(e) if e.closes_connection() => return Err(e),
                    // The transfer engine already wrote its own in-band
                    // sentinel frame for a mid-transfer size change; don't
                    // send a second reply on top of it.
                    Err(ProtocolError::SourceChanged(ref reason)) => {
                        warn!(%reason, "source changed during transfer");
                    }
                    Err(e) => {
                        if let Some(sentinel) = e.wire_sentinel() {
                            send_line(stream, &sentinel, timeout).await?;
                        }
                        warn!(error = %e, "command failed, connection continues");
                    }
                }
            }

            ConnectionState::Closed => return Ok(()),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    ctx: &ServerContext,
    peer_ip: IpAddr,
    peer_hostname: &str,
    _username: &str,
    peer_digest: &str,
    session_key: Option<&crate::crypto::cipher::SessionKey>,
    command: Command,
    timeout: Duration,
) -> Result<()> {
    match command {
        Command::Version => {
            send_line(stream, &format!("OK: {}", env!("CARGO_PKG_VERSION")), timeout).await
        }

        Command::Get { max_block_size, path } => {
            serve_get(stream, ctx, peer_ip, peer_hostname, peer_digest, &path, max_block_size, None, timeout).await
        }

        Command::Sget { length } => {
            let key = session_key
                .ok_or_else(|| ProtocolError::ProtocolViolation("SGET without session key".into()))?;
            let ciphertext = recv_frame(stream, timeout).await?.payload;
            if ciphertext.len() != length {
                return Err(ProtocolError::ProtocolViolation("SGET length mismatch".into()));
            }
            let plaintext = decrypt_block(key, &ciphertext)
                .map_err(|e| ProtocolError::ProtocolViolation(format!("decrypting SGET body: {e}")))?;
            let inner = String::from_utf8(plaintext)
                .map_err(|e| ProtocolError::ProtocolViolation(format!("non-UTF8 SGET body: {e}")))?;
            let (_dummy, rest) = inner
                .split_once(' ')
                .ok_or_else(|| ProtocolError::ProtocolViolation("malformed SGET body".into()))?;
            let (_, path) = rest
                .split_once(' ')
                .unwrap_or(("", rest));
            serve_get(stream, ctx, peer_ip, peer_hostname, peer_digest, path, 0, Some(key), timeout).await
        }

        Command::OpenDir { path } => serve_opendir(stream, ctx, peer_ip, peer_hostname, peer_digest, &path, false, timeout).await,

        Command::SOpenDir { length } => {
            let key = session_key
                .ok_or_else(|| ProtocolError::ProtocolViolation("SOPENDIR without session key".into()))?;
            let ciphertext = recv_frame(stream, timeout).await?.payload;
            if ciphertext.len() != length {
                return Err(ProtocolError::ProtocolViolation("SOPENDIR length mismatch".into()));
            }
            let plaintext = decrypt_block(key, &ciphertext)
                .map_err(|e| ProtocolError::ProtocolViolation(format!("decrypting SOPENDIR body: {e}")))?;
            let inner = String::from_utf8(plaintext)
                .map_err(|e| ProtocolError::ProtocolViolation(format!("non-UTF8 SOPENDIR body: {e}")))?;
            let path = inner
                .split_once(' ')
                .map(|(_, p)| p)
                .unwrap_or(&inner);
            serve_opendir(stream, ctx, peer_ip, peer_hostname, peer_digest, path, true, timeout).await
        }

        Command::Synch { client_time, path } => {
            serve_synch(stream, ctx, peer_ip, peer_hostname, peer_digest, client_time, &path, timeout).await
        }
        Command::SSynch { length } => {
            let key = session_key
                .ok_or_else(|| ProtocolError::ProtocolViolation("SSYNCH without session key".into()))?;
            let ciphertext = recv_frame(stream, timeout).await?.payload;
            if ciphertext.len() != length {
                return Err(ProtocolError::ProtocolViolation("SSYNCH length mismatch".into()));
            }
            let plaintext = decrypt_block(key, &ciphertext)
                .map_err(|e| ProtocolError::ProtocolViolation(format!("decrypting SSYNCH body: {e}")))?;
            let inner = String::from_utf8(plaintext)
                .map_err(|e| ProtocolError::ProtocolViolation(format!("non-UTF8 SSYNCH body: {e}")))?;
            let (_dummy, rest) = inner
                .split_once(' ')
                .ok_or_else(|| ProtocolError::ProtocolViolation("malformed SSYNCH body".into()))?;
            let (time_str, path) = rest.split_once(' ').unwrap_or((rest, ""));
            let client_time: i64 = time_str
                .parse()
                .map_err(|_| ProtocolError::ProtocolViolation("non-numeric SSYNCH client-time".into()))?;
            serve_synch(stream, ctx, peer_ip, peer_hostname, peer_digest, client_time, path, timeout).await
        }

        Command::Md5 { path, .. } => serve_md5(stream, ctx, peer_ip, peer_hostname, peer_digest, &path, timeout).await,
        Command::SMd5 { length } => {
            let key = session_key
                .ok_or_else(|| ProtocolError::ProtocolViolation("SMD5 without session key".into()))?;
            let ciphertext = recv_frame(stream, timeout).await?.payload;
            if ciphertext.len() != length {
                return Err(ProtocolError::ProtocolViolation("SMD5 length mismatch".into()));
            }
            let plaintext = decrypt_block(key, &ciphertext)
                .map_err(|e| ProtocolError::ProtocolViolation(format!("decrypting SMD5 body: {e}")))?;
            let inner = String::from_utf8(plaintext)
                .map_err(|e| ProtocolError::ProtocolViolation(format!("non-UTF8 SMD5 body: {e}")))?;
            let path = inner.split_once(' ').map(|(_, p)| p).unwrap_or(&inner);
            serve_md5(stream, ctx, peer_ip, peer_hostname, peer_digest, path, timeout).await
        }

        Command::Var { name } => serve_var(stream, ctx, &name, timeout).await,
        Command::SVar { length } => {
            let key = session_key
                .ok_or_else(|| ProtocolError::ProtocolViolation("SVAR without session key".into()))?;
            let ciphertext = recv_frame(stream, timeout).await?.payload;
            if ciphertext.len() != length {
                return Err(ProtocolError::ProtocolViolation("SVAR length mismatch".into()));
            }
            let plaintext = decrypt_block(key, &ciphertext)
                .map_err(|e| ProtocolError::ProtocolViolation(format!("decrypting SVAR body: {e}")))?;
            let inner = String::from_utf8_lossy(&plaintext).into_owned();
            let name = inner.strip_prefix("VAR ").unwrap_or(&inner).trim();
            serve_var(stream, ctx, name, timeout).await
        }

        Command::Context { pattern } => serve_context(stream, ctx, &pattern, timeout).await,
        Command::SContext { length } => {
            let key = session_key
                .ok_or_else(|| ProtocolError::ProtocolViolation("SCONTEXT without session key".into()))?;
            let ciphertext = recv_frame(stream, timeout).await?.payload;
            if ciphertext.len() != length {
                return Err(ProtocolError::ProtocolViolation("SCONTEXT length mismatch".into()));
            }
            let plaintext = decrypt_block(key, &ciphertext)
                .map_err(|e| ProtocolError::ProtocolViolation(format!("decrypting SCONTEXT body: {e}")))?;
            let inner = String::from_utf8_lossy(&plaintext).into_owned();
            let pattern = inner.strip_prefix("CONTEXT ").unwrap_or(&inner).trim();
            serve_context(stream, ctx, pattern, timeout).await
        }

        Command::SQuery { length } => {
            let key = session_key
                .ok_or_else(|| ProtocolError::ProtocolViolation("SQUERY without session key".into()))?;
            let ciphertext = recv_frame(stream, timeout).await?.payload;
            if ciphertext.len() != length {
                return Err(ProtocolError::ProtocolViolation("SQUERY length mismatch".into()));
            }
            let plaintext = decrypt_block(key, &ciphertext)
                .map_err(|e| ProtocolError::ProtocolViolation(format!("decrypting SQUERY body: {e}")))?;
            let inner = String::from_utf8_lossy(&plaintext).into_owned();
            let name = inner.strip_prefix("QUERY ").unwrap_or(&inner).trim();
            serve_var(stream, ctx, name, timeout).await
        }

        Command::SCallBack { length } => {
            let payload = recv_frame(stream, timeout).await?.payload;
            if payload.len() != length {
                warn!("SCALLBACK length mismatch, proceeding with what was received");
            }
            info!("SCALLBACK received, disconnecting");
            Ok(())
        }

        Command::Exec { args } => serve_exec(stream, &args, timeout).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_get<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    ctx: &ServerContext,
    peer_ip: IpAddr,
    peer_hostname: &str,
    peer_digest: &str,
    path: &str,
    max_block_size: usize,
    session_key: Option<&crate::crypto::cipher::SessionKey>,
    timeout: Duration,
) -> Result<()> {
    let workdir = Path::new(&ctx.config.keys.work_dir);
    let resolved = shortcut_substitute(path, peer_ip, peer_hostname, peer_digest);
    let normalized = access::normalize_path(&resolved, workdir);

    let decision = access::evaluate_path(
        &ctx.rules.path,
        &normalized,
        session_key.is_some(),
        true,
        peer_ip,
        peer_hostname,
    );
    if !decision.allowed {
        return Err(ProtocolError::AccessDenied(format!("GET {normalized}")));
    }

    send_file(stream, Path::new(&normalized), max_block_size, session_key, timeout).await
}

#[allow(clippy::too_many_arguments)]
async fn serve_opendir<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    ctx: &ServerContext,
    peer_ip: IpAddr,
    peer_hostname: &str,
    peer_digest: &str,
    path: &str,
    encrypted: bool,
    timeout: Duration,
) -> Result<()> {
    let workdir = Path::new(&ctx.config.keys.work_dir);
    let resolved = shortcut_substitute(path, peer_ip, peer_hostname, peer_digest);
    let normalized = access::normalize_path(&resolved, workdir);

    let decision = access::evaluate_path(&ctx.rules.path, &normalized, encrypted, true, peer_ip, peer_hostname);
    if !decision.allowed {
        return Err(ProtocolError::AccessDenied(format!("OPENDIR {normalized}")));
    }

    let entries = std::fs::read_dir(&normalized)
        .map_err(|e| ProtocolError::FileMissing(format!("opendir {normalized}: {e}")))?;
    let names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();

    send_opendir(stream, names, timeout).await
}

#[allow(clippy::too_many_arguments)]
async fn serve_synch<S: AsyncWrite + Unpin>(
    stream: &mut S,
    ctx: &ServerContext,
    peer_ip: IpAddr,
    peer_hostname: &str,
    peer_digest: &str,
    client_time: i64,
    path: &str,
    timeout: Duration,
) -> Result<()> {
    let workdir = Path::new(&ctx.config.keys.work_dir);
    let resolved = shortcut_substitute(path, peer_ip, peer_hostname, peer_digest);
    let normalized = access::normalize_path(&resolved, workdir);

    let decision = access::evaluate_path(&ctx.rules.path, &normalized, false, true, peer_ip, peer_hostname);
    if !decision.allowed {
        return Err(ProtocolError::AccessDenied(format!("SYNCH {normalized}")));
    }

    let local_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let drift = local_time - client_time;
    let threshold = ctx.config.access.clock_skew_threshold.as_secs() as i64;

    if ctx.config.access.deny_bad_clocks && drift * drift > threshold * threshold {
        return Err(ProtocolError::ClockSkew("clocks out of synch".to_string()));
    }

    let reply = stat_path(Path::new(&normalized))?;
    send_line(stream, &reply.encode(), timeout).await
}

async fn serve_md5<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    ctx: &ServerContext,
    peer_ip: IpAddr,
    peer_hostname: &str,
    peer_digest: &str,
    path: &str,
    timeout: Duration,
) -> Result<()> {
    let workdir = Path::new(&ctx.config.keys.work_dir);
    let resolved = shortcut_substitute(path, peer_ip, peer_hostname, peer_digest);
    let normalized = access::normalize_path(&resolved, workdir);

    let decision = access::evaluate_path(&ctx.rules.path, &normalized, false, true, peer_ip, peer_hostname);
    if !decision.allowed {
        return Err(ProtocolError::AccessDenied(format!("MD5 {normalized}")));
    }

    let digest_frame = recv_frame(stream, timeout).await?;
    let contents = std::fs::read(&normalized)
        .map_err(|e| ProtocolError::ReadError(format!("reading {normalized} for MD5: {e}")))?;
    let differs = digest_differs(&digest_frame.payload, &contents);
    send_line(stream, if differs { "CFD_TRUE" } else { "CFD_FALSE" }, timeout).await
}

async fn serve_var<S: AsyncWrite + Unpin>(
    stream: &mut S,
    ctx: &ServerContext,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    if !access::evaluate_name(&ctx.rules.variable, name) {
        return Err(ProtocolError::AccessDenied(format!("VAR {name}")));
    }

    match ctx.literals.get(name) {
        Some(value) => send_line(stream, &format!("OK: {value}"), timeout).await,
        None => send_line(stream, "BAD: no such variable", timeout).await,
    }
}

async fn serve_context<S: AsyncWrite + Unpin>(
    stream: &mut S,
    ctx: &ServerContext,
    pattern: &str,
    timeout: Duration,
) -> Result<()> {
    let matched = access::evaluate_context(&ctx.rules.context, pattern, &ctx.persistent_classes)?;
    send_line(stream, &matched.join(","), timeout).await
}

async fn serve_exec<S: AsyncWrite + Unpin>(
    stream: &mut S,
    args: &str,
    timeout: Duration,
) -> Result<()> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(args)
        .output()
        .await
        .map_err(|e| ProtocolError::Fatal(format!("spawning EXEC command: {e}")))?;

    send_frame(stream, &output.stdout, FrameStatus::More, timeout).await?;
    send_frame(stream, &output.stderr, FrameStatus::Done, timeout).await?;
    Ok(())
}
