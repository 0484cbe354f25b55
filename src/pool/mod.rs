// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-side connection pool (§4.J), grounded in the teacher's
//! `client::pool_sessions` `DashMap`-keyed cache: keyed by the resolved
//! server IP rather than the unresolved name, so aliases of the same host
//! share one slot.

use std::net::IpAddr;

use dashmap::DashMap;
use tokio::net::TcpStream;

struct Slot {
    connection: Option<TcpStream>,
    busy: bool,
    offline: bool,
}

/// Pool of idle client connections, one per resolved server address.
/// Background (parallel) requests bypass this pool entirely (§4.J) — they
/// open, use, and close their own connection.
#[derive(Default)]
pub struct ConnectionPool {
    slots: DashMap<IpAddr, Slot>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self { slots: DashMap::new() }
    }

    /// `get-idle(server)`: takes the cached non-busy connection for
    /// `server`, if any, marking it busy.
    pub fn get_idle(&self, server: IpAddr) -> Option<TcpStream> {
        let mut entry = self.slots.get_mut(&server)?;
        if entry.busy {
            return None;
        }
        let conn = entry.connection.take()?;
        entry.busy = true;
        Some(conn)
    }

    /// `cache(connection, server)`: stores a freshly-established
    /// connection as busy.
    pub fn cache(&self, server: IpAddr, connection: TcpStream) {
        self.slots.insert(server, Slot { connection: Some(connection), busy: true, offline: false });
    }

    /// `mark-offline(server)`: records a failed connection attempt so
    /// subsequent requests in this run skip it without retrying.
    pub fn mark_offline(&self, server: IpAddr) {
        self.slots
            .entry(server)
            .and_modify(|s| s.offline = true)
            .or_insert(Slot { connection: None, busy: false, offline: true });
    }

    pub fn is_offline(&self, server: IpAddr) -> bool {
        self.slots.get(&server).is_some_and(|s| s.offline)
    }

    /// `release(connection)`: returns the connection to the idle pool and
    /// clears the busy flag.
    pub fn release(&self, server: IpAddr, connection: TcpStream) {
        self.slots
            .entry(server)
            .and_modify(|s| {
                s.connection = Some(connection);
                s.busy = false;
            })
            .or_insert_with(|| Slot { connection: None, busy: false, offline: false });
    }
}
