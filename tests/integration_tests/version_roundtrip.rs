// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use cfprotocol::wire::{send_frame, recv_frame, FrameStatus};

use crate::integration_tests::common::{connect_and_auth, permissive_path_rules, spawn_server};

#[tokio::test]
async fn version_replies_with_the_crate_version() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let addr = spawn_server(dir.path(), permissive_path_rules("/srv")).await?;
    let (mut stream, _session_key) = connect_and_auth(addr, "root").await?;

    let timeout = Duration::from_secs(2);
    send_frame(&mut stream, b"VERSION", FrameStatus::Done, timeout).await?;
    let reply = recv_frame(&mut stream, timeout).await?;

    assert_eq!(
        String::from_utf8(reply.payload)?,
        format!("OK: {}", env!("CARGO_PKG_VERSION"))
    );
    Ok(())
}
