// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use cfprotocol::wire::{send_frame, recv_frame, FrameStatus};

use crate::integration_tests::common::{connect_and_auth, permissive_path_rules, spawn_server};

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[tokio::test]
async fn drifted_client_clock_is_refused() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let addr = spawn_server(dir.path(), permissive_path_rules("/srv")).await?;
    let (mut stream, _session_key) = connect_and_auth(addr, "root").await?;
    let timeout = Duration::from_secs(2);

    let drifted = now_secs() - 100_000;
    let request = format!("SYNCH {drifted} /srv/anything");
    send_frame(&mut stream, request.as_bytes(), FrameStatus::Done, timeout).await?;

    let reply = recv_frame(&mut stream, timeout).await?;
    assert_eq!(String::from_utf8(reply.payload)?, "BAD: clocks out of synch");
    Ok(())
}

#[tokio::test]
async fn in_sync_client_clock_gets_a_stat_reply() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let srv_dir = dir.path().join("srv");
    tokio::fs::create_dir_all(&srv_dir).await?;
    let target = srv_dir.join("watched.txt");
    tokio::fs::write(&target, b"hello").await?;

    let addr = spawn_server(dir.path(), permissive_path_rules(&srv_dir.to_string_lossy())).await?;
    let (mut stream, _session_key) = connect_and_auth(addr, "root").await?;
    let timeout = Duration::from_secs(2);

    let request = format!("SYNCH {} {}", now_secs(), target.display());
    send_frame(&mut stream, request.as_bytes(), FrameStatus::Done, timeout).await?;

    let reply = recv_frame(&mut stream, timeout).await?;
    let text = String::from_utf8(reply.payload)?;
    assert!(text.starts_with("OK: f"));
    Ok(())
}
