// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Authentication dialogue (§4.E): the five-message `SAUTH` RSA
//! mutual-identification handshake, client- and server-driven sides.

pub mod client;
pub mod messages;
pub mod server;

use std::time::Duration;

use rsa::{BigUint, RsaPublicKey};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    crypto::cipher::SessionKey,
    error::{ProtocolError, Result},
    wire::{FrameStatus, recv_frame, send_frame},
};

/// Outcome of a completed handshake, from either side's point of view.
pub struct AuthOutcome {
    pub session_key: SessionKey,
    pub peer_digest: String,
    pub peer_public_key: RsaPublicKey,
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

async fn send_line<W: AsyncWrite + Unpin>(w: &mut W, line: &str, timeout: Duration) -> Result<()> {
    send_frame(w, line.as_bytes(), FrameStatus::Done, timeout).await
}

async fn recv_line<R: AsyncRead + Unpin>(r: &mut R, timeout: Duration) -> Result<String> {
    let frame = recv_frame(r, timeout).await?;
    String::from_utf8(frame.payload)
        .map_err(|e| ProtocolError::ProtocolViolation(format!("non-UTF8 SAUTH line: {e}")))
}

async fn send_bytes<W: AsyncWrite + Unpin>(
    w: &mut W,
    payload: &[u8],
    timeout: Duration,
) -> Result<()> {
    send_frame(w, payload, FrameStatus::Done, timeout).await
}

async fn recv_bytes<R: AsyncRead + Unpin>(r: &mut R, timeout: Duration) -> Result<Vec<u8>> {
    Ok(recv_frame(r, timeout).await?.payload)
}

fn rsa_public_key_from_mpi(modulus: &BigUint, exponent: &BigUint) -> Result<RsaPublicKey> {
    RsaPublicKey::new(modulus.clone(), exponent.clone())
        .map_err(|e| ProtocolError::AuthFailure(format!("invalid peer public key: {e}")))
}

/// Checks that `digest` equals the SHA-256 of `data`, as the S2/C4 steps
/// each require of the other side.
fn verify_digest(expected: &[u8], data: &[u8]) -> Result<()> {
    if expected == sha256(data) {
        Ok(())
    } else {
        Err(ProtocolError::AuthFailure(
            "challenge digest mismatch".to_string(),
        ))
    }
}
