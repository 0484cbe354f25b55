// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Boolean enumeration with string serialization support.
///
/// Represents yes/no values with support for various string representations
/// including "Yes"/"No", "true"/"false", and "1"/"0".
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum YesNo {
    #[serde(
        rename = "Yes",
        alias = "yes",
        alias = "YES",
        alias = "true",
        alias = "True",
        alias = "1"
    )]
    Yes,
    #[serde(
        rename = "No",
        alias = "no",
        alias = "NO",
        alias = "false",
        alias = "False",
        alias = "0"
    )]
    No,
}
impl fmt::Display for YesNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            YesNo::Yes => "Yes",
            YesNo::No => "No",
        })
    }
}
impl From<bool> for YesNo {
    fn from(b: bool) -> Self {
        if b { YesNo::Yes } else { YesNo::No }
    }
}
impl YesNo {
    pub fn as_bool(self) -> bool {
        matches!(self, YesNo::Yes)
    }
}

/// Cipher family selected by the one-character cipher selector carried in
/// the `SAUTH` handshake (§4.B). `Community` is Blowfish; the enterprise
/// variants use AES at increasing key sizes, matching how the original
/// system dispatches on a single cipher chosen from this byte.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherFamily {
    /// `c` — Blowfish-CBC, 16-byte key.
    Community,
    /// `a` — AES-128-CBC, 16-byte key.
    Aes128,
    /// `b` — AES-192-CBC, 24-byte key.
    Aes192,
    /// `d` — AES-256-CBC, 32-byte key.
    Aes256,
    /// `3` — 3DES-CBC (EDE), 24-byte key. Accepted for compatibility; not
    /// advertised as a default.
    TripleDes,
}

impl CipherFamily {
    /// Parses the one-character cipher selector from the `SAUTH` line.
    pub fn from_selector(c: char) -> Self {
        match c {
            'a' => CipherFamily::Aes128,
            'b' => CipherFamily::Aes192,
            'd' => CipherFamily::Aes256,
            '3' => CipherFamily::TripleDes,
            // Unrecognized selectors degrade to the community cipher
            // rather than failing the handshake outright.
            _ => CipherFamily::Community,
        }
    }

    pub fn selector(self) -> char {
        match self {
            CipherFamily::Community => 'c',
            CipherFamily::Aes128 => 'a',
            CipherFamily::Aes192 => 'b',
            CipherFamily::Aes256 => 'd',
            CipherFamily::TripleDes => '3',
        }
    }

    /// Session-key length in bytes implied by this cipher family.
    pub fn key_len(self) -> usize {
        match self {
            CipherFamily::Community => 16,
            CipherFamily::Aes128 => 16,
            CipherFamily::Aes192 => 24,
            CipherFamily::Aes256 => 32,
            CipherFamily::TripleDes => 24,
        }
    }
}

impl fmt::Display for CipherFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CipherFamily::Community => "community",
            CipherFamily::Aes128 => "aes128",
            CipherFamily::Aes192 => "aes192",
            CipherFamily::Aes256 => "aes256",
            CipherFamily::TripleDes => "3des",
        })
    }
}

/// Direction marker for a lastseen entry (§3 Lastseen entry / §4.D).
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LastSeenRole {
    /// We connected out to the peer (client role).
    Connect,
    /// The peer connected to us and authenticated (server role).
    Accept,
}

impl LastSeenRole {
    /// The key-space prefix used in the lastseen store (§6 file formats):
    /// `+` for accept, `-` for connect.
    pub fn prefix(self) -> u8 {
        match self {
            LastSeenRole::Accept => b'+',
            LastSeenRole::Connect => b'-',
        }
    }
}

impl fmt::Display for LastSeenRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LastSeenRole::Connect => "connect",
            LastSeenRole::Accept => "accept",
        })
    }
}

/// The marker an access rule must carry to participate in a given
/// evaluator, per §4.F / §9's unification design note.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessRuleKind {
    /// Path access: files, directory listing, stat, hash comparison.
    Path,
    /// Literal/query access: named variables, queries, callback
    /// registration.
    Literal,
    /// Variable access sharing the literal evaluator's exact-match
    /// semantics but kept distinct for clearer rule authoring.
    Variable,
    /// Context access: persistent class queries (full-regex match).
    Context,
}
