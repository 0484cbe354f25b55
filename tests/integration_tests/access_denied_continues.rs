// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use cfprotocol::{access::RuleSet, wire::{send_frame, recv_frame, FrameStatus}};

use crate::integration_tests::common::{connect_and_auth, spawn_server};

#[tokio::test]
async fn access_denial_keeps_the_connection_open_for_the_next_command() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let addr = spawn_server(dir.path(), RuleSet::default()).await?;
    let (mut stream, _session_key) = connect_and_auth(addr, "root").await?;
    let timeout = Duration::from_secs(2);

    send_frame(&mut stream, b"GET 2048 /srv/anything", FrameStatus::Done, timeout).await?;
    let denied = recv_frame(&mut stream, timeout).await?;
    assert_eq!(String::from_utf8(denied.payload)?, "BAD: Access denied");

    send_frame(&mut stream, b"VERSION", FrameStatus::Done, timeout).await?;
    let version = recv_frame(&mut stream, timeout).await?;
    assert_eq!(
        String::from_utf8(version.payload)?,
        format!("OK: {}", env!("CARGO_PKG_VERSION"))
    );
    Ok(())
}
