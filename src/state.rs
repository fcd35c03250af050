use anyhow::Context;
use std::sync::Arc;
use std::time::Instant;

use crate::cli::CommandArgs;
use crate::config::DaemonSettings;
use crate::metrics::MetricsRegistry;
use crate::services::{Launcher, Supervisor};

pub struct AppStateInner {
    pub config: Arc<CommandArgs>,
    pub supervisor: Supervisor,
    pub launcher: Launcher,
    pub metrics: MetricsRegistry,
    pub started_at: Instant,
}

/// Shared by every HTTP worker; the supervisor does its own locking.
pub type AppState = Arc<AppStateInner>;

pub fn new_state(args: CommandArgs) -> anyhow::Result<AppState> {
    let config = Arc::new(args);
    let supervisor = Supervisor::new(DaemonSettings::from(config.as_ref()));
    let launcher = Launcher::new(config.clone(), supervisor.clone());
    let metrics = MetricsRegistry::new().context("register metrics")?;

    Ok(Arc::new(AppStateInner {
        config,
        supervisor,
        launcher,
        metrics,
        started_at: Instant::now(),
    }))
}
