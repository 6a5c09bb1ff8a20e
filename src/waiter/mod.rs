// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Correlates asynchronous server/peer replies with the request that
//! triggered them (spec.md §4.3).

pub mod registry;
pub mod wait_key;

pub use registry::Waiter;
pub use wait_key::{WaitKey, WaitKeyComponent, WaitKind};
