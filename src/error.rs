// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error kinds shared by every component, per the error-handling design in
//! the protocol specification: each variant carries the policy decision
//! (close the connection, keep it open and reply in-band, or abort the
//! process) in how callers are expected to handle it, not in the type
//! itself.

use thiserror::Error;

/// Typed protocol error. `Display` renders a human-readable diagnostic for
/// logs; the wire sentinel text (`"BAD: …"`, `CFD_TRUE`, …) is produced
/// separately by [`ProtocolError::wire_sentinel`] so a future wire-format
/// change doesn't require touching this enum's semantics.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed frame, wrong command for the current state, or an
    /// out-of-range length. Policy: close the connection, log at info.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A handshake step failed (wrong digest, untrusted key, decrypt
    /// failure). Policy: close the connection, log at error.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// An access-control rule refused the request. Policy: send the failure
    /// sentinel, keep the connection open.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Policy: reported in-band with the failure sentinel, connection
    /// continues.
    #[error("path too long: {0}")]
    PathTooLong(String),

    /// Policy: reported in-band with the failure sentinel, connection
    /// continues.
    #[error("file missing: {0}")]
    FileMissing(String),

    /// Policy: reported in-band with the failure sentinel, connection
    /// continues.
    #[error("read error: {0}")]
    ReadError(String),

    /// Mid-transfer size-change detection. Policy: in-band `changed`
    /// sentinel, command aborts, connection continues.
    #[error("source changed during transfer: {0}")]
    SourceChanged(String),

    /// SYNCH reply only. Policy: `BAD: clocks out of synch`, command
    /// completes.
    #[error("clock skew: {0}")]
    ClockSkew(String),

    /// A socket operation exceeded its budget. Policy: close the
    /// connection, log at verbose.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Corrupted local state, missing key pair, or store-engine error.
    /// Policy: abort the process with a diagnostic.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ProtocolError {
    /// Whether this error closes the connection (as opposed to being
    /// reported in-band while the connection stays open).
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            ProtocolError::ProtocolViolation(_)
                | ProtocolError::AuthFailure(_)
                | ProtocolError::Timeout(_)
                | ProtocolError::Fatal(_)
        )
    }

    /// The wire sentinel text a peer should see for this error, where
    /// applicable. Not every variant has a fixed sentinel (e.g.
    /// `ProtocolViolation` just closes the socket).
    pub fn wire_sentinel(&self) -> Option<String> {
        match self {
            ProtocolError::AuthFailure(reason) => {
                Some(format!("BAD: {reason}"))
            },
            ProtocolError::AccessDenied(_) => Some("BAD: Access denied".to_string()),
            ProtocolError::PathTooLong(_) => Some("BAD: path too long".to_string()),
            ProtocolError::FileMissing(_) => Some("BAD: unable to stat".to_string()),
            ProtocolError::ReadError(_) => Some("BAD: read error".to_string()),
            ProtocolError::SourceChanged(_) => Some("changed".to_string()),
            ProtocolError::ClockSkew(reason) => Some(format!("BAD: {reason}")),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
