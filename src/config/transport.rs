//! UDP transport configuration (`udp.*`).

use serde::{Deserialize, Serialize};

/// Default UDP port.
const DEFAULT_PORT: u16 = 7717;

/// Default receive buffer size; comfortably above the protocol MTU.
const DEFAULT_RECV_BUFFER: usize = 2_048;

/// UDP socket configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Port to bind (`udp.port`). 0 selects an ephemeral port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind an IPv4 wildcard socket (`udp.bind_v4`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_v4: Option<bool>,

    /// Bind an IPv6 wildcard socket (`udp.bind_v6`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_v6: Option<bool>,

    /// Per-datagram receive buffer size in bytes (`udp.recv_buffer`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recv_buffer: Option<usize>,
}

impl UdpConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn bind_v4(&self) -> bool {
        self.bind_v4.unwrap_or(true)
    }

    pub fn bind_v6(&self) -> bool {
        self.bind_v6.unwrap_or(true)
    }

    pub fn recv_buffer(&self) -> usize {
        self.recv_buffer.unwrap_or(DEFAULT_RECV_BUFFER)
    }

    /// Merge another udp section into this one.
    pub fn merge(&mut self, other: UdpConfig) {
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.bind_v4.is_some() {
            self.bind_v4 = other.bind_v4;
        }
        if other.bind_v6.is_some() {
            self.bind_v6 = other.bind_v6;
        }
        if other.recv_buffer.is_some() {
            self.recv_buffer = other.recv_buffer;
        }
    }
}
