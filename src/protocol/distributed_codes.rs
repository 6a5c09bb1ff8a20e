// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Distributed-network message codes. The distributed overlay itself is
//! out of scope (spec.md §1); this enum exists only so the framing layer
//! can recognise and discard distributed frames arriving on a connection
//! that also carries peer traffic, without misparsing their single-byte
//! code as a `u32` one.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DistributedCode {
    Ping = 0,
    SearchRequest = 3,
    BranchLevel = 4,
    BranchRoot = 5,
}

impl DistributedCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Ping,
            3 => Self::SearchRequest,
            4 => Self::BranchLevel,
            5 => Self::BranchRoot,
            _ => return None,
        })
    }
}
