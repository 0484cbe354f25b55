// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use cfprotocol::{
    auth::{client::run_client_handshake, server::{keystore_identity_decision, run_server_handshake}},
    cfg::{config::TrustConfig, enums::CipherFamily},
    crypto::keys::RsaKeyPair,
    keystore::KeyStore,
};

#[tokio::test]
async fn second_connection_reuses_the_trusted_key_without_reprompting() {
    let dir = tempfile::tempdir().expect("tempdir");
    let keystore = KeyStore::new(dir.path());
    let trust = TrustConfig { trust_keys_from: vec!["127.*".to_string()] };
    let peer_ip = "127.0.0.1".parse().expect("valid ip");
    let timeout = Duration::from_secs(2);

    let server_keys = RsaKeyPair::generate().expect("server keygen");
    let client_keys = RsaKeyPair::generate().expect("client keygen");

    // Round 1: nothing on file yet for this username.
    assert!(keystore.find_any_for_user("root").expect("lookup").is_none());

    let (mut client_stream, mut server_stream) = tokio::io::duplex(64 * 1024);
    let (client_result, server_result) = tokio::join!(
        run_client_handshake(
            &mut client_stream,
            &client_keys.private,
            &client_keys.public,
            None,
            CipherFamily::Aes128,
            timeout,
        ),
        run_server_handshake(
            &mut server_stream,
            &server_keys.private,
            &server_keys.public,
            peer_ip,
            timeout,
            |key, digest| keystore_identity_decision(&keystore, "root", peer_ip, &trust, key, digest),
        ),
    );
    let first_outcome = client_result.expect("round 1 client handshake");
    server_result.expect("round 1 server handshake");

    keystore
        .trust_and_save(&trust, "root", peer_ip, &first_outcome.peer_public_key)
        .expect("TOFU save");

    // Round 2: the client now has a key on file and should present it
    // instead of trusting blind.
    let known = keystore
        .find_any_for_user("root")
        .expect("lookup")
        .expect("key present after round 1");

    let (mut client_stream, mut server_stream) = tokio::io::duplex(64 * 1024);
    let (client_result, server_result) = tokio::join!(
        run_client_handshake(
            &mut client_stream,
            &client_keys.private,
            &client_keys.public,
            Some(&known),
            CipherFamily::Aes128,
            timeout,
        ),
        run_server_handshake(
            &mut server_stream,
            &server_keys.private,
            &server_keys.public,
            peer_ip,
            timeout,
            |key, digest| keystore_identity_decision(&keystore, "root", peer_ip, &trust, key, digest),
        ),
    );
    let second_outcome = client_result.expect("round 2 client handshake");
    server_result.expect("round 2 server handshake");

    assert_eq!(second_outcome.peer_digest, first_outcome.peer_digest);
}

#[tokio::test]
async fn untrusted_peer_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let keystore = KeyStore::new(dir.path());
    let trust = TrustConfig { trust_keys_from: vec!["10.*".to_string()] };
    let peer_ip = "192.168.1.5".parse().expect("valid ip");
    let timeout = Duration::from_secs(2);

    let server_keys = RsaKeyPair::generate().expect("server keygen");
    let client_keys = RsaKeyPair::generate().expect("client keygen");

    let (mut client_stream, mut server_stream) = tokio::io::duplex(64 * 1024);
    let (client_result, server_result) = tokio::join!(
        run_client_handshake(
            &mut client_stream,
            &client_keys.private,
            &client_keys.public,
            None,
            CipherFamily::Aes128,
            timeout,
        ),
        run_server_handshake(
            &mut server_stream,
            &server_keys.private,
            &server_keys.public,
            peer_ip,
            timeout,
            |key, digest| keystore_identity_decision(&keystore, "root", peer_ip, &trust, key, digest),
        ),
    );

    assert!(client_result.is_err());
    assert!(server_result.is_err());
}
