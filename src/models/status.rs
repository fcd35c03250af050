use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::ProcessStatus;

/// Tunnel variant and its public hostname, as reported by the tunnel collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    #[serde(rename = "type", default)]
    pub tunnel_type: String,
    #[serde(default)]
    pub domain: String,
}

/// Supervisor tuning as shown to status readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsView {
    /// milliseconds
    pub check_interval: u64,
    pub max_retries: u32,
    /// milliseconds
    pub restart_delay: u64,
}

/// Point-in-time copy of every process record.
///
/// Records are flattened next to the aggregate fields, so the JSON carries one
/// key per process name plus `tunnel_info`, `config`, `timestamp` and `uptime`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(flatten)]
    pub processes: BTreeMap<String, ProcessStatus>,
    pub tunnel_info: TunnelInfo,
    pub config: SettingsView,
    pub timestamp: DateTime<Utc>,
    /// Seconds since the supervisor was created
    pub uptime: u64,
}
