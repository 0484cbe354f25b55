// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use cfprotocol::{transfer::receive_file, wire::{send_frame, FrameStatus}};

use crate::integration_tests::common::{connect_and_auth, permissive_path_rules, spawn_server};

#[tokio::test]
async fn get_streams_a_file_verbatim() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let srv_dir = dir.path().join("srv");
    tokio::fs::create_dir_all(&srv_dir).await?;
    let src_path = srv_dir.join("report.txt");
    let contents = b"the quick brown fox jumps over the lazy dog".repeat(100);
    tokio::fs::write(&src_path, &contents).await?;

    let addr = spawn_server(dir.path(), permissive_path_rules(&srv_dir.to_string_lossy())).await?;
    let (mut stream, _session_key) = connect_and_auth(addr, "root").await?;

    let timeout = Duration::from_secs(2);
    let request = format!("GET 2048 {}", src_path.display());
    send_frame(&mut stream, request.as_bytes(), FrameStatus::Done, timeout).await?;

    let dest_path = dir.path().join("received.txt");
    let total = receive_file(&mut stream, &dest_path, None, timeout).await?;

    assert_eq!(total, contents.len() as u64);
    let received = tokio::fs::read(&dest_path).await?;
    assert_eq!(received, contents);
    Ok(())
}
