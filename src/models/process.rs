use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Monitoring agent.
pub const NEZHA: &str = "nezha";
/// Proxy core.
pub const XRAY: &str = "xray";
/// Tunnel client; the only record carrying tunnel tags.
pub const TUNNEL: &str = "tunnel";
/// Restart target fanning out to every known process.
pub const ALL: &str = "all";

pub const MANAGED_PROCESSES: [&str; 3] = [NEZHA, XRAY, TUNNEL];

/// Launch directive for one named process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Unique process name
    pub name: String,
    /// Resolved binary path
    pub command: PathBuf,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
        }
    }
}

/// Lifecycle phase of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Not running and no restart pending.
    Stopped,
    /// Launch in progress.
    Starting,
    Running,
    /// Exited abnormally, a restart timer is armed.
    Restarting,
    /// Retries exhausted; waits for an explicit restart.
    PermanentlyFailed,
}

/// Status record of one supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub name: String,
    /// Whether the process is currently running
    pub running: bool,
    /// Automatic restarts since the last explicit start or restart
    pub retries: u32,
    pub last_start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<DateTime<Utc>>,
    /// PID of the current or most recent incarnation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub tunnel_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    pub state: ProcessState,
}

impl ProcessStatus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            running: false,
            retries: 0,
            last_start: Utc::now(),
            last_exit: None,
            pid: None,
            tunnel_type: String::new(),
            domain: String::new(),
            state: ProcessState::Stopped,
        }
    }

    /// Moves the record to `state`, keeping `running` in step with it.
    pub fn set_state(&mut self, state: ProcessState) {
        self.state = state;
        self.running = state == ProcessState::Running;
    }

    /// Marks the current incarnation as gone.
    pub fn mark_exited(&mut self, state: ProcessState) {
        self.set_state(state);
        self.last_exit = Some(Utc::now());
    }
}
