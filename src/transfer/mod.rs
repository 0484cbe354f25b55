// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! File transfer engine (§4.H): server-side block streaming for `GET`
//! (plaintext) and `SGET` (CBC-encrypted), with mid-transfer change
//! detection, and the matching client-side receive/truncate contract.

use std::{path::Path, time::Duration};

use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
};
use tracing::warn;

use crate::{
    crypto::cipher::{SessionKey, encrypt_block, decrypt_block},
    error::{ProtocolError, Result},
    wire::{FrameStatus, recv_frame, send_frame},
};

/// Blocks above this size are clamped down; below it, the requested size
/// is honored (§4.H).
pub const DEFAULT_BLOCK_SIZE: usize = 2048;
/// Source larger than this switches to the coarser re-stat sampling rate.
const LARGE_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// In-band sentinels carried in a block frame in place of file data.
pub const SENTINEL_CHANGED: &[u8] = b"changed";
pub const SENTINEL_FAILED: &[u8] = b"failed";

fn restat_interval(file_len: u64) -> u64 {
    if file_len > LARGE_FILE_THRESHOLD { 32 } else { 3 }
}

/// Clamps a client-requested block size to the engine's bound, as the
/// server does "on error" per §4.H (any size outside `1..=DEFAULT_BLOCK_SIZE`
/// is treated as malformed and clamped rather than rejected).
pub fn clamp_block_size(requested: usize) -> usize {
    if requested == 0 || requested > DEFAULT_BLOCK_SIZE {
        DEFAULT_BLOCK_SIZE
    } else {
        requested
    }
}

/// Streams `path` to `w` in fixed-size blocks, re-stating the source at a
/// sampled rate to detect mid-transfer size changes. `session_key` being
/// `Some` switches to CBC-encrypted blocks (`SGET`); `None` sends
/// plaintext (`GET`).
pub async fn send_file<W: AsyncWrite + Unpin>(
    w: &mut W,
    path: &Path,
    requested_block_size: usize,
    session_key: Option<&SessionKey>,
    io_timeout: Duration,
) -> Result<()> {
    let block_size = clamp_block_size(requested_block_size);

    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(?path, %e, "GET: failed to open source");
            send_frame(w, SENTINEL_FAILED, FrameStatus::Done, io_timeout).await?;
            return Ok(());
        }
    };

    let initial_len = file
        .metadata()
        .await
        .map_err(|e| ProtocolError::ReadError(format!("stat {path:?}: {e}")))?
        .len();

    let mut buf = vec![0u8; block_size];
    let mut block_index: u64 = 0;
    let mut current_len = initial_len;

    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| ProtocolError::ReadError(format!("reading {path:?}: {e}")))?;

        block_index += 1;
        if block_index % restat_interval(current_len) == 0 {
            let meta = tokio::fs::metadata(path)
                .await
                .map_err(|e| ProtocolError::ReadError(format!("re-stat {path:?}: {e}")))?;
            if meta.len() != initial_len {
                send_frame(w, SENTINEL_CHANGED, FrameStatus::Done, io_timeout).await?;
                return Err(ProtocolError::SourceChanged(format!(
                    "{path:?} changed size during transfer"
                )));
            }
            current_len = meta.len();
        }

        if n == 0 {
            send_frame(w, &[], FrameStatus::Done, io_timeout).await?;
            return Ok(());
        }

        let chunk = &buf[..n];
        let is_last = n < block_size;
        let status = if is_last { FrameStatus::Done } else { FrameStatus::More };

        match session_key {
            Some(key) => {
                let ciphertext = encrypt_block(key, chunk)
                    .map_err(|e| ProtocolError::Fatal(format!("encrypting block: {e}")))?;
                send_frame(w, &ciphertext, status, io_timeout).await?;
            }
            None => send_frame(w, chunk, status, io_timeout).await?,
        }

        if is_last {
            return Ok(());
        }
    }
}

/// Client-side receive: reads frames until `done`, decrypting each block
/// independently when `session_key` is set, writing into `dest` and
/// finally truncating it to the exact received byte count.
pub async fn receive_file<R: AsyncRead + Unpin>(
    r: &mut R,
    dest: &Path,
    session_key: Option<&SessionKey>,
    io_timeout: Duration,
) -> Result<u64> {
    if dest.exists() {
        std::fs::remove_file(dest)
            .map_err(|e| ProtocolError::Fatal(format!("unlinking {dest:?}: {e}")))?;
    }

    let mut out = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode_0600_if_unix()
        .open(dest)
        .await
        .map_err(|e| ProtocolError::Fatal(format!("creating {dest:?}: {e}")))?;

    let mut total: u64 = 0;
    loop {
        let frame = recv_frame(r, io_timeout).await?;
        if frame.payload == SENTINEL_CHANGED {
            return Err(ProtocolError::SourceChanged(format!(
                "{dest:?} source changed mid-transfer"
            )));
        }
        if frame.payload == SENTINEL_FAILED {
            return Err(ProtocolError::ReadError(format!("server failed to read source for {dest:?}")));
        }

        if !frame.payload.is_empty() {
            let plaintext = match session_key {
                Some(key) => decrypt_block(key, &frame.payload)
                    .map_err(|e| ProtocolError::ProtocolViolation(format!("decrypting block: {e}")))?,
                None => frame.payload,
            };
            out.write_all(&plaintext)
                .await
                .map_err(|e| ProtocolError::Fatal(format!("writing {dest:?}: {e}")))?;
            total += plaintext.len() as u64;
        }

        if frame.status == FrameStatus::Done {
            break;
        }
    }

    out.flush()
        .await
        .map_err(|e| ProtocolError::Fatal(format!("flushing {dest:?}: {e}")))?;
    out.set_len(total)
        .await
        .map_err(|e| ProtocolError::Fatal(format!("truncating {dest:?}: {e}")))?;
    Ok(total)
}

/// Tiny extension so `receive_file` can request mode 0600 on Unix without
/// an `#[cfg]` block inline at the call site.
trait OpenOptionsExt0600 {
    fn mode_0600_if_unix(self) -> Self;
}

impl OpenOptionsExt0600 for tokio::fs::OpenOptions {
    #[cfg(unix)]
    fn mode_0600_if_unix(mut self) -> Self {
        use std::os::unix::fs::OpenOptionsExt as _;
        self.mode(0o600);
        self
    }

    #[cfg(not(unix))]
    fn mode_0600_if_unix(self) -> Self {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plaintext_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("src.bin");
        let dest = dir.path().join("dest.bin");
        tokio::fs::write(&src, vec![7u8; 5000]).await.expect("write src");

        let mut buf = Vec::new();
        send_file(&mut buf, &src, 1024, None, Duration::from_secs(2))
            .await
            .expect("send");

        let mut cursor = std::io::Cursor::new(buf);
        let total = receive_file(&mut cursor, &dest, None, Duration::from_secs(2))
            .await
            .expect("receive");
        assert_eq!(total, 5000);
        let received = tokio::fs::read(&dest).await.expect("read dest");
        assert_eq!(received.len(), 5000);
        assert!(received.iter().all(|&b| b == 7));
    }

    #[tokio::test]
    async fn encrypted_round_trip() {
        use crate::cfg::enums::CipherFamily;

        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("src.bin");
        let dest = dir.path().join("dest.bin");
        tokio::fs::write(&src, b"the quick brown fox".repeat(200))
            .await
            .expect("write src");

        let key = SessionKey::generate(CipherFamily::Aes128);

        let mut buf = Vec::new();
        send_file(&mut buf, &src, 512, Some(&key), Duration::from_secs(2))
            .await
            .expect("send");

        let mut cursor = std::io::Cursor::new(buf);
        let total = receive_file(&mut cursor, &dest, Some(&key), Duration::from_secs(2))
            .await
            .expect("receive");

        let expected = b"the quick brown fox".repeat(200);
        assert_eq!(total, expected.len() as u64);
        let received = tokio::fs::read(&dest).await.expect("read dest");
        assert_eq!(received, expected);
    }

    #[test]
    fn block_size_clamped() {
        assert_eq!(clamp_block_size(0), DEFAULT_BLOCK_SIZE);
        assert_eq!(clamp_block_size(999_999), DEFAULT_BLOCK_SIZE);
        assert_eq!(clamp_block_size(512), 512);
    }
}
