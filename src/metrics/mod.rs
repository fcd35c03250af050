use prometheus::{
    register_gauge_vec_with_registry, register_gauge_with_registry, Encoder, Gauge, GaugeVec,
    Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, PoisonError};
use sysinfo::System;

use crate::models::{ProcessState, StatusSnapshot};

/// Prometheus view of the supervisor, rebuilt from a status snapshot on every scrape.
pub struct MetricsRegistry {
    registry: Registry,
    hostname: String,
    /// Held across observe and render so concurrent scrapes never interleave
    scrape_lock: Mutex<()>,

    pub process_up: GaugeVec,
    pub process_retries: GaugeVec,
    pub process_pid: GaugeVec,
    pub process_last_start_timestamp: GaugeVec,
    pub process_permanently_failed: GaugeVec,
    pub uptime_seconds: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let hostname = System::host_name().unwrap_or_else(|| "unknown".to_string());

        // 定义通用的标签
        let common_labels = &["name", "hostname"];

        let process_up = register_gauge_vec_with_registry!(
            Opts::new("daemon_process_up", "Supervised process is running (1) or down (0)"),
            common_labels,
            registry
        )?;

        let process_retries = register_gauge_vec_with_registry!(
            Opts::new("daemon_process_retries", "Automatic restarts since the last explicit start"),
            common_labels,
            registry
        )?;

        let process_pid = register_gauge_vec_with_registry!(
            Opts::new("daemon_process_pid", "PID of the current incarnation, 0 when down"),
            common_labels,
            registry
        )?;

        let process_last_start_timestamp = register_gauge_vec_with_registry!(
            Opts::new(
                "daemon_process_last_start_timestamp_seconds",
                "Unix timestamp of the last launch attempt"
            ),
            common_labels,
            registry
        )?;

        let process_permanently_failed = register_gauge_vec_with_registry!(
            Opts::new(
                "daemon_process_permanently_failed",
                "Process exhausted its restart budget (1) or not (0)"
            ),
            common_labels,
            registry
        )?;

        let uptime_seconds = register_gauge_with_registry!(
            Opts::new("daemon_uptime_seconds", "Seconds since the supervisor was created")
                .const_label("hostname", hostname.as_str()),
            registry
        )?;

        Ok(Self {
            registry,
            hostname,
            scrape_lock: Mutex::new(()),
            process_up,
            process_retries,
            process_pid,
            process_last_start_timestamp,
            process_permanently_failed,
            uptime_seconds,
        })
    }

    /// Rebuilds the series from `snapshot` and renders the text exposition.
    pub fn scrape(&self, snapshot: &StatusSnapshot) -> anyhow::Result<String> {
        let _guard = self.scrape_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.observe(snapshot);
        self.render()
    }

    /// Replaces every per-process series with the values from `snapshot`.
    fn observe(&self, snapshot: &StatusSnapshot) {
        // 先清理旧的 label，避免残留已消失的进程
        self.process_up.reset();
        self.process_retries.reset();
        self.process_pid.reset();
        self.process_last_start_timestamp.reset();
        self.process_permanently_failed.reset();

        for (name, status) in &snapshot.processes {
            let labels = &[name.as_str(), self.hostname.as_str()];

            self.process_up
                .with_label_values(labels)
                .set(if status.running { 1.0 } else { 0.0 });
            self.process_retries
                .with_label_values(labels)
                .set(f64::from(status.retries));
            self.process_pid
                .with_label_values(labels)
                .set(status.pid.filter(|_| status.running).map(f64::from).unwrap_or(0.0));
            self.process_last_start_timestamp
                .with_label_values(labels)
                .set(status.last_start.timestamp() as f64);
            self.process_permanently_failed
                .with_label_values(labels)
                .set(if status.state == ProcessState::PermanentlyFailed { 1.0 } else { 0.0 });
        }

        self.uptime_seconds.set(snapshot.uptime as f64);
    }

    fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProcessStatus, SettingsView, TunnelInfo};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn snapshot(records: Vec<ProcessStatus>) -> StatusSnapshot {
        StatusSnapshot {
            processes: records
                .into_iter()
                .map(|record| (record.name.clone(), record))
                .collect::<BTreeMap<_, _>>(),
            tunnel_info: TunnelInfo::default(),
            config: SettingsView {
                check_interval: 30_000,
                max_retries: 5,
                restart_delay: 10_000,
            },
            timestamp: Utc::now(),
            uptime: 42,
        }
    }

    /// Value of the first `metric` sample, optionally filtered by process name.
    fn sample<'a>(text: &'a str, metric: &str, name: Option<&str>) -> Option<&'a str> {
        text.lines()
            .filter(|line| line.starts_with(&format!("{}{{", metric)))
            .find(|line| name.map_or(true, |n| line.contains(&format!("name=\"{}\"", n))))
            .and_then(|line| line.rsplit(' ').next())
    }

    #[test]
    fn test_render_reflects_snapshot() {
        let metrics = MetricsRegistry::new().unwrap();

        let mut xray = ProcessStatus::new("xray");
        xray.pid = Some(1234);
        xray.set_state(ProcessState::Running);

        let mut tunnel = ProcessStatus::new("tunnel");
        tunnel.retries = 5;
        tunnel.pid = Some(99);
        tunnel.set_state(ProcessState::PermanentlyFailed);

        metrics.observe(&snapshot(vec![xray, tunnel]));
        let text = metrics.render().unwrap();

        assert_eq!(sample(&text, "daemon_uptime_seconds", None), Some("42"));
        assert_eq!(sample(&text, "daemon_process_up", Some("xray")), Some("1"));
        assert_eq!(sample(&text, "daemon_process_pid", Some("xray")), Some("1234"));
        assert_eq!(sample(&text, "daemon_process_pid", Some("tunnel")), Some("0"));
        assert_eq!(sample(&text, "daemon_process_retries", Some("tunnel")), Some("5"));
        assert_eq!(
            sample(&text, "daemon_process_permanently_failed", Some("tunnel")),
            Some("1")
        );
        assert!(text.contains(&format!("hostname=\"{}\"", metrics.hostname)));
    }

    #[test]
    fn test_vanished_processes_are_dropped() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.observe(&snapshot(vec![ProcessStatus::new("nezha")]));
        assert!(metrics.render().unwrap().contains("name=\"nezha\""));

        metrics.observe(&snapshot(vec![ProcessStatus::new("xray")]));
        let text = metrics.render().unwrap();
        assert!(!text.contains("name=\"nezha\""));
        assert!(text.contains("name=\"xray\""));
    }

    #[test]
    fn test_concurrent_scrapes_render_whole_snapshots() {
        let metrics = MetricsRegistry::new().unwrap();
        let sets: [[&str; 3]; 2] = [["nezha", "tunnel", "xray"], ["alpha", "beta", "gamma"]];

        std::thread::scope(|scope| {
            for names in &sets {
                let metrics = &metrics;
                scope.spawn(move || {
                    let records: Vec<ProcessStatus> =
                        names.iter().map(|name| ProcessStatus::new(name)).collect();
                    for _ in 0..200 {
                        let text = metrics.scrape(&snapshot(records.clone())).unwrap();
                        let up_series = text
                            .lines()
                            .filter(|line| line.starts_with("daemon_process_up{"))
                            .count();
                        assert_eq!(up_series, 3);
                        for name in names {
                            assert!(text.contains(&format!("name=\"{}\"", name)));
                        }
                    }
                });
            }
        });
    }
}
