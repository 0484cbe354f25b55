// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire encoding for the `SAUTH` handshake lines (§4.E). Each step sends a
//! short ASCII command line as one frame, optionally followed by a binary
//! payload frame (challenge, MPI component, or session key).

use crate::{
    cfg::enums::CipherFamily,
    error::{ProtocolError, Result},
};

/// Nonce length in bytes; `challenge_len`/`crypt_len` are bounded by twice
/// this (§4.E).
pub const NONCE_LEN: usize = 64;
pub const MAX_CHALLENGE_LEN: usize = 2 * NONCE_LEN;

/// The first `SAUTH` line: `SAUTH <y/n> <crypt_len> <challenge_len>
/// <enterprise_field>`.
pub struct SauthC1 {
    pub iscrypt: bool,
    pub crypt_len: usize,
    pub challenge_len: usize,
    pub cipher: CipherFamily,
}

impl SauthC1 {
    pub fn encode(&self) -> String {
        format!(
            "SAUTH {} {} {} {}",
            if self.iscrypt { 'y' } else { 'n' },
            self.crypt_len,
            self.challenge_len,
            self.cipher.selector()
        )
    }

    /// Parses a `SAUTH` line. A four-field line (missing the enterprise
    /// field) defaults the cipher to community, per §4.E.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let tag = parts.next().ok_or_else(|| bad("empty SAUTH line"))?;
        if tag != "SAUTH" {
            return Err(bad(&format!("expected SAUTH, got {tag:?}")));
        }
        let iscrypt = match parts.next().ok_or_else(|| bad("missing iscrypt field"))? {
            "y" => true,
            "n" => false,
            other => return Err(bad(&format!("bad iscrypt field {other:?}"))),
        };
        let crypt_len: usize = parts
            .next()
            .ok_or_else(|| bad("missing crypt_len field"))?
            .parse()
            .map_err(|_| bad("non-numeric crypt_len"))?;
        let challenge_len: usize = parts
            .next()
            .ok_or_else(|| bad("missing challenge_len field"))?
            .parse()
            .map_err(|_| bad("non-numeric challenge_len"))?;
        let cipher = match parts.next() {
            Some(field) => {
                let c = field
                    .chars()
                    .next()
                    .ok_or_else(|| bad("empty enterprise field"))?;
                CipherFamily::from_selector(c)
            }
            None => CipherFamily::Community,
        };

        if crypt_len > MAX_CHALLENGE_LEN || challenge_len > MAX_CHALLENGE_LEN {
            return Err(ProtocolError::ProtocolViolation(format!(
                "SAUTH lengths exceed bound: crypt_len={crypt_len} challenge_len={challenge_len} bound={MAX_CHALLENGE_LEN}"
            )));
        }

        Ok(Self { iscrypt, crypt_len, challenge_len, cipher })
    }
}

fn bad(msg: &str) -> ProtocolError {
    ProtocolError::ProtocolViolation(format!("malformed SAUTH line: {msg}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c1_round_trips() {
        let c1 = SauthC1 {
            iscrypt: true,
            crypt_len: 128,
            challenge_len: 64,
            cipher: CipherFamily::Aes128,
        };
        let line = c1.encode();
        let parsed = SauthC1::parse(&line).expect("parse");
        assert_eq!(parsed.iscrypt, true);
        assert_eq!(parsed.crypt_len, 128);
        assert_eq!(parsed.challenge_len, 64);
        assert_eq!(parsed.cipher, CipherFamily::Aes128);
    }

    #[test]
    fn four_field_line_defaults_to_community() {
        let parsed = SauthC1::parse("SAUTH y 32 32").expect("parse");
        assert_eq!(parsed.cipher, CipherFamily::Community);
    }

    #[test]
    fn oversize_lengths_rejected() {
        let line = format!("SAUTH y {} {} c", MAX_CHALLENGE_LEN + 1, 8);
        let err = SauthC1::parse(&line).unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
    }
}
