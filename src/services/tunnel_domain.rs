use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::cli::CommandArgs;
use crate::models::process::TUNNEL;
use crate::models::TunnelType;
use crate::services::launcher::TUNNEL_LOG_FILE;
use crate::services::subscription;
use crate::services::supervisor::Supervisor;

fn domain_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"https?://([a-zA-Z0-9.-]+\.trycloudflare\.com)").expect("static regex")
    })
}

/// First quick-tunnel hostname announced in a tunnel client log.
pub fn extract_domain(log: &str) -> Option<String> {
    domain_pattern()
        .captures(log)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// First quick-tunnel hostname written to `log_path` after `offset`.
///
/// A log shorter than `offset` was truncated and is read from the start.
pub fn read_domain_since(log_path: &Path, offset: u64) -> Option<String> {
    let log = fs::read(log_path).ok()?;
    let start = usize::try_from(offset)
        .ok()
        .filter(|start| *start <= log.len())
        .unwrap_or(0);
    extract_domain(&String::from_utf8_lossy(&log[start..]))
}

/// Watches tunnel launches for the public hostname, then records it and
/// renders the subscription.
///
/// Every tunnel (re)launch starts a fresh search; a search still running for
/// an older incarnation is abandoned.
pub struct DomainMonitor {
    args: Arc<CommandArgs>,
    supervisor: Supervisor,
    initial_wait: Duration,
    poll_interval: Duration,
    attempts: u32,
}

impl DomainMonitor {
    pub fn new(args: Arc<CommandArgs>, supervisor: Supervisor) -> Self {
        Self {
            args,
            supervisor,
            initial_wait: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
            attempts: 10,
        }
    }

    fn log_path(&self) -> PathBuf {
        self.args.file_path.join(TUNNEL_LOG_FILE)
    }

    /// Runs until `cancel` fires. `launches` must be subscribed before the
    /// first tunnel launch, see [`Supervisor::subscribe_launches`].
    pub async fn run(self, mut launches: broadcast::Receiver<String>, cancel: CancellationToken) {
        let tunnel_type = TunnelType::analyze(&self.args.argo_auth);
        if tunnel_type != TunnelType::Temporary {
            if self.args.argo_domain.is_empty() {
                log::warn!("No ARGO_DOMAIN configured for the {} tunnel", tunnel_type);
            } else {
                self.publish(&self.args.argo_domain);
            }
            return;
        }

        let mut search_from = None;
        loop {
            let Some(offset) = search_from.take() else {
                match self.next_tunnel_launch(&mut launches, &cancel).await {
                    Some(offset) => search_from = Some(offset),
                    None => return,
                }
                continue;
            };

            tokio::select! {
                found = self.discover(offset, &cancel) => {
                    if let Some(domain) = found {
                        let tunnel_type = self.supervisor.tunnel_info().tunnel_type;
                        self.supervisor.set_tunnel_info(&tunnel_type, &domain);
                        self.publish(&domain);
                    }
                }
                next = self.next_tunnel_launch(&mut launches, &cancel) => match next {
                    Some(offset) => {
                        log::info!("Tunnel relaunched, restarting domain discovery");
                        search_from = Some(offset);
                    }
                    None => return,
                },
            }
        }
    }

    /// Waits for the next tunnel launch and returns the log length at that moment.
    async fn next_tunnel_launch(
        &self,
        launches: &mut broadcast::Receiver<String>,
        cancel: &CancellationToken,
    ) -> Option<u64> {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return None,
                event = launches.recv() => event,
            };

            match event {
                Ok(name) if name == TUNNEL => break,
                Ok(_) => {}
                // missed events may have been tunnel launches
                Err(RecvError::Lagged(_)) => break,
                Err(RecvError::Closed) => return None,
            }
        }

        Some(fs::metadata(self.log_path()).map(|meta| meta.len()).unwrap_or(0))
    }

    /// Polls the tunnel log past `offset`; `None` when the hostname never
    /// showed up or `cancel` fired first.
    pub async fn discover(&self, offset: u64, cancel: &CancellationToken) -> Option<String> {
        log::info!("Watching tunnel log for the public domain...");
        if !sleep_or_cancel(cancel, self.initial_wait).await {
            return None;
        }

        let log_path = self.log_path();
        for attempt in 1..=self.attempts {
            if let Some(domain) = read_domain_since(&log_path, offset) {
                log::info!("🌐 Tunnel domain found: {} (attempt {}/{})", domain, attempt, self.attempts);
                return Some(domain);
            }

            log::debug!("Tunnel domain not ready (attempt {}/{})", attempt, self.attempts);
            if !sleep_or_cancel(cancel, self.poll_interval).await {
                return None;
            }
        }

        log::warn!("Tunnel domain not found in {}, subscription keeps its fallback", log_path.display());
        None
    }

    fn publish(&self, domain: &str) {
        if let Err(e) = subscription::generate(&self.args, domain) {
            log::error!("Failed to generate subscription: {:#}", e);
        }
    }
}

/// False when cancelled before `duration` elapsed.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
