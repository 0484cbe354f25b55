// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client side of the `SAUTH` handshake (§4.E). The client drives every
//! step.

use std::time::Duration;

use rand::RngCore as _;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey, traits::PublicKeyParts as _};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::{
    auth::{
        AuthOutcome, recv_bytes, recv_line, rsa_public_key_from_mpi, send_bytes, send_line,
        sha256, verify_digest,
        messages::{MAX_CHALLENGE_LEN, NONCE_LEN, SauthC1},
    },
    cfg::enums::CipherFamily,
    crypto::{
        cipher::SessionKey,
        digest::{from_mpi, peer_digest, to_mpi},
    },
    error::{ProtocolError, Result},
};

/// Runs the client side of the handshake over `stream`.
///
/// `known_server_key` is the server's public key if we already trust it
/// from a previous connection (§4.C); passing `None` tells the server we
/// don't trust it implicitly, which makes it send its key back in S4/S5
/// for us to evaluate via trust-on-first-use.
pub async fn run_client_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    my_keys: &RsaPrivateKey,
    my_public: &RsaPublicKey,
    known_server_key: Option<&RsaPublicKey>,
    cipher: CipherFamily,
    io_timeout: Duration,
) -> Result<AuthOutcome> {
    let mut rng = rand::rngs::OsRng;

    let mut challenge = vec![0u8; NONCE_LEN];
    rng.fill_bytes(&mut challenge);

    let iscrypt = known_server_key.is_some();
    let challenge_payload = match known_server_key {
        Some(server_key) => server_key
            .encrypt(&mut rng, Pkcs1v15Encrypt, &challenge)
            .map_err(|e| ProtocolError::Fatal(format!("encrypting C1 challenge: {e}")))?,
        None => challenge.clone(),
    };

    let c1 = SauthC1 {
        iscrypt,
        crypt_len: challenge_payload.len(),
        challenge_len: challenge.len(),
        cipher,
    };
    debug!(iscrypt, "SAUTH C1");
    send_line(stream, &c1.encode(), io_timeout).await?;
    send_bytes(stream, &challenge_payload, io_timeout).await?;

    send_bytes(stream, &to_mpi(my_public.n()), io_timeout).await?; // C2
    send_bytes(stream, &to_mpi(my_public.e()), io_timeout).await?; // C3

    let s1 = recv_line(stream, io_timeout).await?;
    if let Some(reason) = s1.strip_prefix("BAD:") {
        return Err(ProtocolError::AuthFailure(format!(
            "server refused identity:{reason}"
        )));
    }
    if s1 != "OK" {
        return Err(ProtocolError::ProtocolViolation(format!(
            "unexpected S1 response: {s1:?}"
        )));
    }

    let s2_digest = recv_bytes(stream, io_timeout).await?;
    verify_digest(&s2_digest, &challenge)?;

    let s3_ciphertext = recv_bytes(stream, io_timeout).await?;
    let counter_challenge = my_keys
        .decrypt(Pkcs1v15Encrypt, &s3_ciphertext)
        .map_err(|e| ProtocolError::AuthFailure(format!("decrypting S3 counter-challenge: {e}")))?;

    let server_key = match known_server_key {
        Some(key) => key.clone(),
        None => {
            let s4 = recv_bytes(stream, io_timeout).await?;
            let (modulus, _) = from_mpi(&s4).ok_or_else(|| {
                ProtocolError::ProtocolViolation("malformed S4 modulus".to_string())
            })?;
            let s5 = recv_bytes(stream, io_timeout).await?;
            let (exponent, _) = from_mpi(&s5).ok_or_else(|| {
                ProtocolError::ProtocolViolation("malformed S5 exponent".to_string())
            })?;
            rsa_public_key_from_mpi(&modulus, &exponent)?
        }
    };

    send_bytes(stream, &sha256(&counter_challenge), io_timeout).await?; // C4

    let session_key = SessionKey::generate(cipher);
    if session_key.bytes.len() > MAX_CHALLENGE_LEN {
        return Err(ProtocolError::Fatal(
            "session key longer than the handshake can carry".to_string(),
        ));
    }
    let c5 = server_key
        .encrypt(&mut rng, Pkcs1v15Encrypt, &session_key.bytes)
        .map_err(|e| ProtocolError::Fatal(format!("encrypting C5 session key: {e}")))?;
    send_bytes(stream, &c5, io_timeout).await?;

    let peer_digest = peer_digest(&server_key);
    info!(peer_digest = %peer_digest, "SAUTH handshake complete (client)");

    Ok(AuthOutcome { session_key, peer_digest, peer_public_key: server_key })
}
