// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(clippy::all)]

mod integration_tests {
    pub mod common;

    pub mod access_denied_continues;
    pub mod clock_skew_synch;
    pub mod get_file_roundtrip;
    pub mod version_roundtrip;
}
