// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Transaction framing (§4.A): fixed-header + length-prefixed payload
//! send/recv over a stream socket.

pub mod frame;

pub use frame::{Frame, FrameStatus, MAX_FRAME_LEN, recv_frame, send_frame};
