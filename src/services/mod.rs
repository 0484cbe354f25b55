// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Directory/stat/hash services (§4.I): `OPENDIR` name packing, `STAT`
//! line formatting, and the `MD5` compare step.

use std::path::Path;

use md5::{Digest as _, Md5};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    error::{ProtocolError, Result},
    wire::{FrameStatus, recv_frame, send_frame},
};

/// Frames are flushed with `more` once the packing buffer approaches this
/// size, keeping well under `MAX_FRAME_LEN`.
const PACK_FLUSH_THRESHOLD: usize = 32 * 1024;
const OPENDIR_TERMINATOR: &[u8] = b"\x00\x00";

/// Packs `names` as NUL-terminated entries, flushing frames with `more`
/// once the buffer nears [`PACK_FLUSH_THRESHOLD`], then sends the
/// dedicated terminator framed as `done`.
pub async fn send_opendir<W, I>(
    w: &mut W,
    names: I,
    io_timeout: std::time::Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator<Item = String>,
{
    let mut buf = Vec::new();
    for name in names {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        if buf.len() >= PACK_FLUSH_THRESHOLD {
            send_frame(w, &buf, FrameStatus::More, io_timeout).await?;
            buf.clear();
        }
    }
    buf.extend_from_slice(OPENDIR_TERMINATOR);
    send_frame(w, &buf, FrameStatus::Done, io_timeout).await?;
    Ok(())
}

/// Client-side counterpart: reads packed-name frames until `done`,
/// stripping the terminator, and splits on NUL.
pub async fn receive_opendir<R: AsyncRead + Unpin>(
    r: &mut R,
    io_timeout: std::time::Duration,
) -> Result<Vec<String>> {
    let mut names = Vec::new();
    loop {
        let frame = recv_frame(r, io_timeout).await?;
        let payload = if frame.status == FrameStatus::Done {
            frame
                .payload
                .strip_suffix(OPENDIR_TERMINATOR)
                .map(<[u8]>::to_vec)
                .unwrap_or(frame.payload)
        } else {
            frame.payload
        };
        for entry in payload.split(|&b| b == 0) {
            if !entry.is_empty() {
                names.push(String::from_utf8_lossy(entry).into_owned());
            }
        }
        if frame.status == FrameStatus::Done {
            return Ok(names);
        }
    }
}

/// The fields of a `STAT` reply (§4.I), independent of platform so the
/// formatting logic stays testable off Unix too.
#[derive(Debug, Clone, PartialEq)]
pub struct StatReply {
    pub file_type: char,
    pub mode: u32,
    pub lmode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub makeholes: bool,
    pub ino: u64,
    pub nlink: u64,
    pub dev: u64,
    pub readlink: Option<String>,
}

impl StatReply {
    /// `OK: <type> <mode> <lmode> <uid> <gid> <size> <atime> <mtime>
    /// <ctime> <makeholes> <ino> <nlink> <dev>` followed by a second line
    /// `OK:<readlink>`.
    pub fn encode(&self) -> String {
        format!(
            "OK: {} {} {} {} {} {} {} {} {} {} {} {} {}\nOK:{}",
            self.file_type,
            self.mode,
            self.lmode,
            self.uid,
            self.gid,
            self.size,
            self.atime,
            self.mtime,
            self.ctime,
            if self.makeholes { 1 } else { 0 },
            self.ino,
            self.nlink,
            self.dev,
            self.readlink.as_deref().unwrap_or("")
        )
    }
}

#[cfg(unix)]
pub fn stat_path(path: &Path) -> Result<StatReply> {
    use std::os::unix::fs::MetadataExt as _;

    let meta = std::fs::symlink_metadata(path)
        .map_err(|e| ProtocolError::FileMissing(format!("stat {path:?}: {e}")))?;

    let file_type = if meta.is_dir() {
        'd'
    } else if meta.file_type().is_symlink() {
        'l'
    } else {
        'f'
    };

    let readlink = if meta.file_type().is_symlink() {
        std::fs::read_link(path)
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
    } else {
        None
    };

    // Sparse when the allocated block count times the device's block
    // size is smaller than the logical size.
    let allocated = meta.blocks() * 512;
    let makeholes = allocated < meta.size();

    Ok(StatReply {
        file_type,
        mode: meta.mode(),
        lmode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.size(),
        atime: meta.atime(),
        mtime: meta.mtime(),
        ctime: meta.ctime(),
        makeholes,
        ino: meta.ino(),
        nlink: meta.nlink(),
        dev: meta.dev(),
        readlink,
    })
}

/// Verdict of the `MD5`/`SMD5` compare step: `true` means the file
/// differs from the client's digest and should be re-transferred.
pub fn digest_differs(local_digest: &[u8], file_bytes: &[u8]) -> bool {
    if local_digest.len() == 32 {
        let mut hasher = Sha256::new();
        hasher.update(file_bytes);
        let computed: [u8; 32] = hasher.finalize().into();
        return computed != local_digest[..];
    }
    if local_digest.len() == 16 {
        let mut hasher = Md5::new();
        hasher.update(file_bytes);
        let computed: [u8; 16] = hasher.finalize().into();
        return computed != local_digest[..];
    }
    // Unknown digest length: treat as a mismatch so the caller
    // re-transfers rather than silently trusting a short/garbage digest.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opendir_round_trips_many_names() {
        let names: Vec<String> = (0..5).map(|i| format!("file{i}.txt")).collect();
        let mut buf = Vec::new();
        send_opendir(&mut buf, names.clone(), std::time::Duration::from_secs(1))
            .await
            .expect("send");

        let mut cursor = std::io::Cursor::new(buf);
        let received = receive_opendir(&mut cursor, std::time::Duration::from_secs(1))
            .await
            .expect("receive");
        assert_eq!(received, names);
    }

    #[test]
    fn stat_reply_encodes_two_lines() {
        let reply = StatReply {
            file_type: 'f',
            mode: 0o644,
            lmode: 0o644,
            uid: 1000,
            gid: 1000,
            size: 4096,
            atime: 1,
            mtime: 2,
            ctime: 3,
            makeholes: false,
            ino: 99,
            nlink: 1,
            dev: 2,
            readlink: None,
        };
        let encoded = reply.encode();
        let mut lines = encoded.lines();
        assert!(lines.next().unwrap().starts_with("OK: f 420"));
        assert_eq!(lines.next().unwrap(), "OK:");
    }

    #[test]
    fn sha256_digest_match_reports_no_difference() {
        let data = b"hello world";
        let mut hasher = Sha256::new();
        hasher.update(data);
        let digest: [u8; 32] = hasher.finalize().into();
        assert!(!digest_differs(&digest, data));
    }

    #[test]
    fn legacy_md5_digest_mismatch_reports_difference() {
        let digest = [0u8; 16];
        assert!(digest_differs(&digest, b"hello world"));
    }
}
