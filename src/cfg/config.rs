// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client configuration (spec.md §"Configuration options recognised",
//! SPEC_FULL.md §"Ambient: configuration").
//!
//! Loaded via `serde_yaml`, then `validate_and_normalize`d immediately —
//! numeric ranges (listen port, distributed child limit, max speeds) are
//! rejected here rather than left to fail later deep in the connection
//! layer.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Connect/IO timeout pair shared by every connection category. Each
/// category (server, peer, transfer, incoming, distributed) gets its own
/// instance so they can be tuned independently even though the shape is
/// identical.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ConnectionOptions {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_io_timeout_ms() -> u64 {
    30_000
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

impl ConnectionOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    fn validate(&self, label: &str) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            bail!("{label}.connect_timeout_ms must be greater than zero");
        }
        if self.io_timeout_ms == 0 {
            bail!("{label}.io_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

pub type ServerConnectionOptions = ConnectionOptions;
pub type PeerConnectionOptions = ConnectionOptions;
pub type TransferConnectionOptions = ConnectionOptions;
pub type IncomingConnectionOptions = ConnectionOptions;
pub type DistributedConnectionOptions = ConnectionOptions;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub username: String,
    pub password: String,

    #[serde(default = "default_true")]
    pub enable_listener: bool,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,

    #[serde(default = "default_true")]
    pub enable_distributed_network: bool,
    #[serde(default = "default_true")]
    pub accept_distributed_children: bool,
    #[serde(default = "default_distributed_child_limit")]
    pub distributed_child_limit: u32,

    #[serde(default = "default_true")]
    pub deduplicate_search_requests: bool,
    #[serde(default = "default_true")]
    pub auto_acknowledge_private_messages: bool,
    #[serde(default = "default_true")]
    pub auto_acknowledge_privilege_notifications: bool,
    #[serde(default)]
    pub accept_private_room_invitations: bool,

    #[serde(default)]
    pub server_connection_options: ServerConnectionOptions,
    #[serde(default)]
    pub peer_connection_options: PeerConnectionOptions,
    #[serde(default)]
    pub transfer_connection_options: TransferConnectionOptions,
    #[serde(default)]
    pub incoming_connection_options: IncomingConnectionOptions,
    #[serde(default)]
    pub distributed_connection_options: DistributedConnectionOptions,

    /// Kilobytes/second. `0` means unlimited. Converted to a token-bucket
    /// capacity via `(kb_s * 1024) / 10` (bytes released per 100ms tick).
    #[serde(default)]
    pub maximum_upload_speed: u64,
    /// Kilobytes/second. `0` means unlimited. Same conversion as
    /// `maximum_upload_speed`.
    #[serde(default)]
    pub maximum_download_speed: u64,

    #[serde(default = "default_cache_size")]
    pub user_endpoint_cache_size: usize,
    #[serde(default = "default_cache_size")]
    pub search_response_cache_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_listen_port() -> u16 {
    2234
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_distributed_child_limit() -> u32 {
    10
}

fn default_cache_size() -> usize {
    1000
}

impl ClientConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read client config: {path}"))?;
        let mut config: ClientConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse client config: {path}"))?;
        config.validate_and_normalize()?;
        Ok(config)
    }

    /// Validates numeric ranges and normalizes case-insensitive fields.
    /// Username/password *non-emptiness* is deliberately NOT enforced
    /// here — that is a runtime concern checked by `Session::login`, not
    /// a config-load-time one (spec.md §"Argument validation").
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        self.server_connection_options.validate("server_connection_options")?;
        self.peer_connection_options.validate("peer_connection_options")?;
        self.transfer_connection_options.validate("transfer_connection_options")?;
        self.incoming_connection_options.validate("incoming_connection_options")?;
        self.distributed_connection_options.validate("distributed_connection_options")?;

        if self.listen_ip.parse::<std::net::Ipv4Addr>().is_err() {
            bail!("listen_ip must be a valid IPv4 address, got {:?}", self.listen_ip);
        }

        self.listen_ip = self.listen_ip.trim().to_string();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        "username: alice\npassword: hunter2\n"
    }

    #[test]
    fn defaults_fill_in_missing_fields() {
        let mut cfg: ClientConfig = serde_yaml::from_str(minimal_yaml()).expect("parse");
        cfg.validate_and_normalize().expect("validate");
        assert_eq!(cfg.listen_port, 2234);
        assert!(cfg.enable_listener);
        assert_eq!(cfg.server_connection_options.connect_timeout_ms, 10_000);
    }

    #[test]
    fn zero_io_timeout_is_rejected() {
        let mut cfg: ClientConfig = serde_yaml::from_str(minimal_yaml()).expect("parse");
        cfg.peer_connection_options.io_timeout_ms = 0;
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn invalid_listen_ip_is_rejected() {
        let mut cfg: ClientConfig = serde_yaml::from_str(minimal_yaml()).expect("parse");
        cfg.listen_ip = "not-an-ip".to_string();
        assert!(cfg.validate_and_normalize().is_err());
    }
}
