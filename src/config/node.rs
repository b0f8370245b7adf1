//! Node-level configuration (`node.*`).

use serde::{Deserialize, Serialize};

/// Default interval between housekeeping passes.
const DEFAULT_HOUSEKEEPING_INTERVAL_MS: u64 = 1_000;

/// Node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identifier of the world definition this node trusts
    /// (`node.world_id`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_id: Option<u64>,

    /// Timestamp of the world definition (`node.world_timestamp`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_timestamp: Option<u64>,

    /// Extra endpoints to advertise in PUSH_DIRECT_PATHS beyond the bound
    /// sockets, as `ip:port` literals (`node.announce`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub announce: Vec<String>,

    /// Interval between ping/clean/push housekeeping passes in
    /// milliseconds (`node.housekeeping_interval_ms`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub housekeeping_interval_ms: Option<u64>,
}

impl NodeConfig {
    pub fn world_id(&self) -> u64 {
        self.world_id.unwrap_or(0)
    }

    pub fn world_timestamp(&self) -> u64 {
        self.world_timestamp.unwrap_or(0)
    }

    pub fn housekeeping_interval_ms(&self) -> u64 {
        self.housekeeping_interval_ms
            .unwrap_or(DEFAULT_HOUSEKEEPING_INTERVAL_MS)
    }

    /// Merge another node section into this one.
    pub fn merge(&mut self, other: NodeConfig) {
        if other.world_id.is_some() {
            self.world_id = other.world_id;
        }
        if other.world_timestamp.is_some() {
            self.world_timestamp = other.world_timestamp;
        }
        if !other.announce.is_empty() {
            self.announce = other.announce;
        }
        if other.housekeeping_interval_ms.is_some() {
            self.housekeeping_interval_ms = other.housekeeping_interval_ms;
        }
    }
}
