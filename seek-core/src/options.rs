//! Client and connection options. Deserializable so hosts can embed them in their config file.

use std::time::Duration;

use serde::Deserialize;

/// Timeouts and retry policy for one kind of connection (server, peer or distributed).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionOptions {
    /// Connect timeout in milliseconds (default 10000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Inactivity timeout for reads in milliseconds; `None` waits indefinitely.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: Option<u64>,
    /// Write timeout in milliseconds (default 5000).
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Connect attempts before giving up (default 1).
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Largest single socket read, in bytes (default 16 KiB).
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_read_timeout_ms() -> Option<u64> {
    Some(15_000)
}
fn default_write_timeout_ms() -> u64 {
    5_000
}
fn default_connect_attempts() -> u32 {
    1
}
fn default_read_buffer_size() -> usize {
    16 * 1024
}

impl ConnectionOptions {
    /// Server connections are idle for long stretches; they never time out on reads.
    pub fn server() -> Self {
        Self {
            read_timeout_ms: None,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

/// Options for a [`crate::SoulseekClient`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientOptions {
    /// Default deadline for correlated replies, in milliseconds (default 5000).
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    /// First token handed out; random when unset.
    #[serde(default)]
    pub starting_token: Option<i32>,
    /// Searches are relayed to children only while the branch level is below this depth.
    #[serde(default)]
    pub max_relay_depth: Option<i32>,
    #[serde(default = "ConnectionOptions::server")]
    pub server_connection: ConnectionOptions,
    #[serde(default)]
    pub peer_connection: ConnectionOptions,
    #[serde(default)]
    pub distributed_connection: ConnectionOptions,
}

fn default_message_timeout_ms() -> u64 {
    5_000
}

impl ClientOptions {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            message_timeout_ms: default_message_timeout_ms(),
            starting_token: None,
            max_relay_depth: None,
            server_connection: ConnectionOptions::server(),
            peer_connection: ConnectionOptions::default(),
            distributed_connection: ConnectionOptions::default(),
        }
    }
}
