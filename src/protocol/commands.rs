// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Command set parsing (§4.G table): one variant per wire command, plus
//! whether each requires the connection to already be encrypted.

use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Exec { args: String },
    Version,
    Get { max_block_size: usize, path: String },
    Sget { length: usize },
    OpenDir { path: String },
    SOpenDir { length: usize },
    Synch { client_time: i64, path: String },
    SSynch { length: usize },
    Md5 { path: String, digest: Vec<u8> },
    SMd5 { length: usize },
    Var { name: String },
    SVar { length: usize },
    Context { pattern: String },
    SContext { length: usize },
    SQuery { length: usize },
    SCallBack { length: usize },
}

impl Command {
    /// Whether this command's request body is carried encrypted, per the
    /// §4.G command table's "Encryption required?" column. Commands
    /// marked "varies" (`MD5`/`VAR`/`CONTEXT`) aren't inherently secure —
    /// their `S`-prefixed sibling variant is what carries the requirement.
    pub fn requires_session_key(&self) -> bool {
        matches!(
            self,
            Command::Sget { .. }
                | Command::SOpenDir { .. }
                | Command::SSynch { .. }
                | Command::SMd5 { .. }
                | Command::SVar { .. }
                | Command::SContext { .. }
                | Command::SQuery { .. }
                | Command::SCallBack { .. }
        )
    }
}

/// Parses one command line off the wire. Binary trailers (digest bytes
/// for `MD5`, encrypted payload lengths for the `S`-prefixed commands)
/// are read by the caller as a follow-up frame once the command shape is
/// known.
pub fn parse_command(line: &str) -> Result<Command> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().ok_or_else(|| bad("empty command line"))?;

    match verb {
        "EXEC" => Ok(Command::Exec { args: parts.collect::<Vec<_>>().join(" ") }),
        "VERSION" => Ok(Command::Version),
        "GET" => {
            let max_block_size = next_usize(&mut parts, "max-block-size")?;
            let path = rest(&mut parts, "path")?;
            Ok(Command::Get { max_block_size, path })
        }
        "SGET" => Ok(Command::Sget { length: next_usize(&mut parts, "length")? }),
        "OPENDIR" => Ok(Command::OpenDir { path: rest(&mut parts, "path")? }),
        "SOPENDIR" => Ok(Command::SOpenDir { length: next_usize(&mut parts, "length")? }),
        "SYNCH" => {
            let client_time: i64 = parts
                .next()
                .ok_or_else(|| bad("missing client-time"))?
                .parse()
                .map_err(|_| bad("non-numeric client-time"))?;
            let path = rest(&mut parts, "path")?;
            Ok(Command::Synch { client_time, path })
        }
        "SSYNCH" => Ok(Command::SSynch { length: next_usize(&mut parts, "length")? }),
        "MD5" => {
            let path = rest(&mut parts, "path")?;
            Ok(Command::Md5 { path, digest: Vec::new() })
        }
        "SMD5" => Ok(Command::SMd5 { length: next_usize(&mut parts, "length")? }),
        "VAR" => Ok(Command::Var { name: rest(&mut parts, "name")? }),
        "SVAR" => Ok(Command::SVar { length: next_usize(&mut parts, "length")? }),
        "CONTEXT" => Ok(Command::Context { pattern: rest(&mut parts, "pattern")? }),
        "SCONTEXT" => Ok(Command::SContext { length: next_usize(&mut parts, "length")? }),
        "SQUERY" => Ok(Command::SQuery { length: next_usize(&mut parts, "length")? }),
        "SCALLBACK" => Ok(Command::SCallBack { length: next_usize(&mut parts, "length")? }),
        other => Err(ProtocolError::ProtocolViolation(format!("unknown command {other:?}"))),
    }
}

fn next_usize<'a>(parts: &mut impl Iterator<Item = &'a str>, field: &str) -> Result<usize> {
    parts
        .next()
        .ok_or_else(|| bad(&format!("missing {field}")))?
        .parse()
        .map_err(|_| bad(&format!("non-numeric {field}")))
}

fn rest<'a>(parts: &mut impl Iterator<Item = &'a str>, field: &str) -> Result<String> {
    let joined = parts.collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        Err(bad(&format!("missing {field}")))
    } else {
        Ok(joined)
    }
}

fn bad(msg: &str) -> ProtocolError {
    ProtocolError::ProtocolViolation(format!("malformed command line: {msg}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get() {
        let cmd = parse_command("GET 2048 /srv/data/file.txt").expect("parse");
        assert_eq!(
            cmd,
            Command::Get { max_block_size: 2048, path: "/srv/data/file.txt".to_string() }
        );
    }

    #[test]
    fn parses_version_with_no_arguments() {
        assert_eq!(parse_command("VERSION").expect("parse"), Command::Version);
    }

    #[test]
    fn sget_requires_session_key_get_does_not() {
        assert!(!Command::Get { max_block_size: 1, path: "x".into() }.requires_session_key());
        assert!(Command::Sget { length: 1 }.requires_session_key());
    }

    #[test]
    fn unknown_verb_is_protocol_violation() {
        let err = parse_command("FROB 1 2").unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
    }
}
