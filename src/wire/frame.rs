// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::debug;

use crate::error::{ProtocolError, Result};

/// Header is 16 bytes: one status char, one space, a zero-padded decimal
/// length, and a null terminator (`"t 00000000000123\0"`-shaped, sized to
/// fit `MAX_FRAME_LEN`).
pub const HEADER_LEN: usize = 16;
const LEN_FIELD_WIDTH: usize = HEADER_LEN - 3; // status + space + NUL

/// Maximum payload length in bytes. Frames above this fail on send
/// (`frame-too-large`) and close the connection on recv
/// (`protocol-violation`).
pub const MAX_FRAME_LEN: usize = 65400;

/// Whether more frames follow (`more`) or this is the last one (`done`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Done,
    More,
}

impl FrameStatus {
    fn as_byte(self) -> u8 {
        match self {
            FrameStatus::Done => b't',
            FrameStatus::More => b'm',
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            b't' => Ok(FrameStatus::Done),
            b'm' => Ok(FrameStatus::More),
            other => Err(ProtocolError::ProtocolViolation(format!(
                "invalid frame status byte {other:#04x}"
            ))),
        }
    }
}

/// A single received frame: its completion status plus the raw payload
/// bytes (which may be plaintext or, for an "encrypted frame", ciphertext
/// at a caller-chosen offset — the frame layer itself doesn't know which).
#[derive(Debug, Clone)]
pub struct Frame {
    pub status: FrameStatus,
    pub payload: Vec<u8>,
}

fn encode_header(status: FrameStatus, len: usize) -> Result<[u8; HEADER_LEN]> {
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::ProtocolViolation(format!(
            "frame-too-large: {len} > {MAX_FRAME_LEN}"
        )));
    }
    let mut hdr = [0u8; HEADER_LEN];
    hdr[0] = status.as_byte();
    hdr[1] = b' ';
    let len_str = format!("{len:0width$}", width = LEN_FIELD_WIDTH);
    hdr[2..2 + LEN_FIELD_WIDTH].copy_from_slice(len_str.as_bytes());
    hdr[HEADER_LEN - 1] = 0;
    Ok(hdr)
}

fn decode_header(hdr: &[u8; HEADER_LEN]) -> Result<(FrameStatus, usize)> {
    let status = FrameStatus::from_byte(hdr[0])?;
    if hdr[1] != b' ' {
        return Err(ProtocolError::ProtocolViolation(
            "malformed frame header: missing separator".to_string(),
        ));
    }
    if hdr[HEADER_LEN - 1] != 0 {
        return Err(ProtocolError::ProtocolViolation(
            "malformed frame header: missing terminator".to_string(),
        ));
    }
    let len_str = std::str::from_utf8(&hdr[2..2 + LEN_FIELD_WIDTH]).map_err(|e| {
        ProtocolError::ProtocolViolation(format!("non-UTF8 length field: {e}"))
    })?;
    let len: usize = len_str.trim().parse().map_err(|e| {
        ProtocolError::ProtocolViolation(format!("bad length field {len_str:?}: {e}"))
    })?;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::ProtocolViolation(format!(
            "frame length {len} exceeds MAX_FRAME_LEN"
        )));
    }
    Ok((status, len))
}

async fn io_with_timeout<F, T>(label: &'static str, fut: F, io_timeout: Duration) -> Result<T>
where F: Future<Output = std::io::Result<T>> {
    match timeout(io_timeout, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(ProtocolError::ProtocolViolation(format!("{label}: {e}"))),
        Err(_) => Err(ProtocolError::Timeout(format!(
            "{label} timed out after {io_timeout:?}"
        ))),
    }
}

/// Sends one frame: header then payload. All-or-nothing — a write error
/// midway leaves the socket in an undefined state for the caller to close.
pub async fn send_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    payload: &[u8],
    status: FrameStatus,
    io_timeout: Duration,
) -> Result<()> {
    let hdr = encode_header(status, payload.len())?;
    debug!(status = ?status, len = payload.len(), "send frame");
    io_with_timeout("write frame header", w.write_all(&hdr), io_timeout).await?;
    if !payload.is_empty() {
        io_with_timeout("write frame payload", w.write_all(payload), io_timeout).await?;
    }
    Ok(())
}

/// Receives one frame. Reading the header or payload is all-or-nothing: a
/// short read is a `protocol-violation` that should close the connection.
pub async fn recv_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    io_timeout: Duration,
) -> Result<Frame> {
    let mut hdr = [0u8; HEADER_LEN];
    io_with_timeout("read frame header", r.read_exact(&mut hdr), io_timeout).await?;
    let (status, len) = decode_header(&hdr)?;

    let mut payload = vec![0u8; len];
    if len > 0 {
        io_with_timeout("read frame payload", r.read_exact(&mut payload), io_timeout)
            .await?;
    }
    debug!(status = ?status, len, "recv frame");
    Ok(Frame { status, payload })
}
