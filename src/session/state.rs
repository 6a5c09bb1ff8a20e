// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Composite session state (spec.md §3, §4.4).

use bitflags::bitflags;

bitflags! {
    /// A bit-set over the session's lifecycle stages. `LOGGED_IN` always
    /// implies `CONNECTED` — every transition that sets one sets both.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SessionState: u8 {
        const DISCONNECTED = 0b0000_0001;
        const CONNECTING   = 0b0000_0010;
        const CONNECTED    = 0b0000_0100;
        const LOGGING_IN    = 0b0000_1000;
        const LOGGED_IN     = 0b0001_0000;
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::DISCONNECTED
    }
}

impl SessionState {
    /// Whether the session satisfies "connected and logged in", the
    /// predicate gating most public operations.
    pub fn is_connected_and_logged_in(self) -> bool {
        self.contains(SessionState::CONNECTED) && self.contains(SessionState::LOGGED_IN)
    }

    pub fn is_connected(self) -> bool {
        self.contains(SessionState::CONNECTED)
    }

    pub fn is_logged_in(self) -> bool {
        self.contains(SessionState::LOGGED_IN)
    }
}

/// Parameters the server sends shortly after a successful login,
/// recorded into a snapshot and surfaced via `ServerInfoReceived`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub parent_min_speed: u32,
    pub parent_speed_ratio: u32,
    /// Milliseconds. The wire value is seconds; stored here as
    /// `wire_value * 1000` per the testable-property scenario.
    pub wishlist_interval_ms: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logged_in_without_connected_is_not_gated_open() {
        let state = SessionState::LOGGED_IN;
        assert!(!state.is_connected_and_logged_in());
    }

    #[test]
    fn connected_and_logged_in_together_gate_open() {
        let state = SessionState::CONNECTED | SessionState::LOGGED_IN;
        assert!(state.is_connected_and_logged_in());
    }

    #[test]
    fn default_state_is_disconnected() {
        assert_eq!(SessionState::default(), SessionState::DISCONNECTED);
    }
}
