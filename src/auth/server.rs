// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server side of the `SAUTH` handshake (§4.E). The client drives; the
//! server only responds, but still owns the trust decision (§4.C) for the
//! identity the client presents.

use std::{net::IpAddr, time::Duration};

use rand::RngCore as _;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey, traits::PublicKeyParts as _};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::{
    auth::{
        AuthOutcome, recv_bytes, recv_line, rsa_public_key_from_mpi, send_bytes, send_line,
        sha256, verify_digest,
        messages::{MAX_CHALLENGE_LEN, NONCE_LEN, SauthC1},
    },
    crypto::{
        cipher::SessionKey,
        digest::{from_mpi, peer_digest, to_mpi},
    },
    error::{ProtocolError, Result},
    keystore::KeyStore,
};

/// What the caller decided about an unknown client identity; mirrors the
/// keystore's trust-on-first-use outcome (§4.C).
pub enum IdentityDecision {
    Accepted,
    Refused(String),
}

/// Runs the server side of the handshake over `stream`. `username` and
/// `peer_ip` come from the preceding `CAUTH` frame and the socket's peer
/// address respectively; `decide` is invoked with the client's presented
/// key and digest so the caller can consult the keystore/trust config.
pub async fn run_server_handshake<S, F>(
    stream: &mut S,
    my_keys: &RsaPrivateKey,
    my_public: &RsaPublicKey,
    peer_ip: IpAddr,
    io_timeout: Duration,
    mut decide: F,
) -> Result<AuthOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(&RsaPublicKey, &str) -> IdentityDecision,
{
    let mut rng = rand::rngs::OsRng;

    let c1_line = recv_line(stream, io_timeout).await?;
    let c1 = SauthC1::parse(&c1_line)?;

    let challenge_payload = recv_bytes(stream, io_timeout).await?;
    if challenge_payload.len() != c1.crypt_len || c1.crypt_len > MAX_CHALLENGE_LEN {
        return Err(ProtocolError::ProtocolViolation(
            "C1 challenge length mismatch".to_string(),
        ));
    }
    let challenge = if c1.iscrypt {
        my_keys
            .decrypt(Pkcs1v15Encrypt, &challenge_payload)
            .map_err(|e| ProtocolError::AuthFailure(format!("decrypting C1 challenge: {e}")))?
    } else {
        challenge_payload
    };

    let c2 = recv_bytes(stream, io_timeout).await?;
    let (modulus, _) = from_mpi(&c2)
        .ok_or_else(|| ProtocolError::ProtocolViolation("malformed C2 modulus".to_string()))?;
    let c3 = recv_bytes(stream, io_timeout).await?;
    let (exponent, _) = from_mpi(&c3)
        .ok_or_else(|| ProtocolError::ProtocolViolation("malformed C3 exponent".to_string()))?;
    let client_key = rsa_public_key_from_mpi(&modulus, &exponent)?;
    let client_digest = peer_digest(&client_key);

    // S1 (implicit): accept/refuse the client's presented identity. The
    // client-announced IP from the preceding identity frame is never
    // consulted here; only the socket's own peer address is authoritative.
    let _ = peer_ip;
    match decide(&client_key, &client_digest) {
        IdentityDecision::Accepted => {
            send_line(stream, "OK", io_timeout).await?;
        }
        IdentityDecision::Refused(reason) => {
            send_line(stream, &format!("BAD: {reason}"), io_timeout).await?;
            warn!(%client_digest, %reason, "refused client identity");
            return Err(ProtocolError::AuthFailure(reason));
        }
    }

    send_bytes(stream, &sha256(&challenge), io_timeout).await?; // S2

    let mut counter_challenge = vec![0u8; NONCE_LEN];
    rng.fill_bytes(&mut counter_challenge);
    let s3 = client_key
        .encrypt(&mut rng, Pkcs1v15Encrypt, &counter_challenge)
        .map_err(|e| ProtocolError::Fatal(format!("encrypting S3 counter-challenge: {e}")))?;
    send_bytes(stream, &s3, io_timeout).await?;

    if !c1.iscrypt {
        send_bytes(stream, &to_mpi(my_public.n()), io_timeout).await?; // S4
        send_bytes(stream, &to_mpi(my_public.e()), io_timeout).await?; // S5
    }

    let c4_digest = recv_bytes(stream, io_timeout).await?;
    verify_digest(&c4_digest, &counter_challenge)?;

    let c5 = recv_bytes(stream, io_timeout).await?;
    let session_key_bytes = my_keys
        .decrypt(Pkcs1v15Encrypt, &c5)
        .map_err(|e| ProtocolError::AuthFailure(format!("decrypting C5 session key: {e}")))?;
    let session_key = SessionKey::from_bytes(c1.cipher, session_key_bytes)
        .map_err(|e| ProtocolError::AuthFailure(format!("bad session key: {e}")))?;

    info!(%client_digest, "SAUTH handshake complete (server)");
    Ok(AuthOutcome { session_key, peer_digest: client_digest, peer_public_key: client_key })
}

/// Convenience wrapper around [`KeyStore`]'s TOFU logic for use as the
/// `decide` closure: accepts a known key whose digest matches, accepts an
/// unknown key if the peer is in the trust allowlist (persisting it), and
/// refuses everything else.
pub fn keystore_identity_decision(
    keystore: &KeyStore,
    username: &str,
    peer_ip: IpAddr,
    trust: &crate::cfg::config::TrustConfig,
    presented: &RsaPublicKey,
    presented_digest: &str,
) -> IdentityDecision {
    match keystore.have_public_key(username, peer_ip, presented_digest) {
        Ok(Some(_)) => IdentityDecision::Accepted,
        Ok(None) => match keystore.trust_and_save(trust, username, peer_ip, presented) {
            Ok(_) => IdentityDecision::Accepted,
            Err(e) => IdentityDecision::Refused(e.to_string()),
        },
        Err(e) => IdentityDecision::Refused(e.to_string()),
    }
}
