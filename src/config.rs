use std::path::PathBuf;
use std::time::Duration;

use crate::cli::CommandArgs;

/// Name of the best-effort status cache written next to the runtime files.
pub const STATUS_FILE_NAME: &str = "daemon_status.json";

/// Upper bound for the exponential restart backoff.
pub const RESTART_DELAY_CAP: Duration = Duration::from_secs(60);

/// Tuning knobs for the supervisor, handed over at construction time.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    /// Period between two liveness probes of the same process.
    pub check_interval: Duration,
    /// Automatic restarts allowed before a process is marked permanently failed.
    pub max_retries: u32,
    /// Delay before the first automatic restart.
    pub restart_delay: Duration,
    pub restart_cap: Duration,
    /// Where to cache the last snapshot; `None` disables persistence.
    pub status_file: Option<PathBuf>,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(30_000),
            max_retries: 5,
            restart_delay: Duration::from_millis(10_000),
            restart_cap: RESTART_DELAY_CAP,
            status_file: None,
        }
    }
}

impl From<&CommandArgs> for DaemonSettings {
    fn from(args: &CommandArgs) -> Self {
        Self {
            check_interval: Duration::from_millis(args.daemon_check_interval),
            max_retries: args.daemon_max_retries,
            restart_delay: Duration::from_millis(args.daemon_restart_delay),
            restart_cap: RESTART_DELAY_CAP,
            status_file: Some(args.file_path.join(STATUS_FILE_NAME)),
        }
    }
}
