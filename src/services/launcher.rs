use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cli::CommandArgs;
use crate::models::process::{NEZHA, TUNNEL, XRAY};
use crate::models::{LaunchSpec, TunnelType};
use crate::services::supervisor::Supervisor;

pub const XRAY_BINARY: &str = "xray";
pub const TUNNEL_BINARY: &str = "cloudflared";
pub const NEZHA_AGENT_BINARY: &str = "nezha-agent";
pub const NEZHA_PHP_BINARY: &str = "nezha-php";

pub const XRAY_CONFIG_FILE: &str = "config.json";
pub const NEZHA_CONFIG_FILE: &str = "nezha_config.yaml";
pub const TUNNEL_CREDENTIALS_FILE: &str = "tunnel.json";
pub const TUNNEL_CONFIG_FILE: &str = "tunnel.yml";
pub const TUNNEL_LOG_FILE: &str = "boot.log";

/// Agent ports that are served behind TLS.
const NEZHA_TLS_PORTS: [&str; 6] = ["443", "8443", "2096", "2087", "2083", "2053"];

/// Pause between two launches at startup.
const LAUNCH_GAP: Duration = Duration::from_secs(2);

#[derive(Deserialize)]
struct FixedTunnelCredentials {
    #[serde(rename = "TunnelID")]
    tunnel_id: String,
}

/// Turns the configuration into launch directives and hands them to the supervisor.
///
/// Rendering happens on every launch, so a relaunch after `restart` picks up
/// the current configuration files.
#[derive(Clone)]
pub struct Launcher {
    args: Arc<CommandArgs>,
    supervisor: Supervisor,
}

impl Launcher {
    pub fn new(args: Arc<CommandArgs>, supervisor: Supervisor) -> Self {
        Self { args, supervisor }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.args.file_path.join(file)
    }

    pub fn nezha_enabled(&self) -> bool {
        !self.args.nezha_server.is_empty() && !self.args.nezha_key.is_empty()
    }

    pub fn tunnel_type(&self) -> TunnelType {
        TunnelType::analyze(&self.args.argo_auth)
    }

    /// Launch directive for `name`; `None` when the process is not configured.
    pub fn spec_for(&self, name: &str) -> anyhow::Result<Option<LaunchSpec>> {
        match name {
            NEZHA => self.nezha_spec(),
            XRAY => self.xray_spec().map(Some),
            TUNNEL => self.tunnel_spec().map(Some),
            other => bail!("unknown process '{}'", other),
        }
    }

    /// Renders the configuration for `name` and starts it under supervision.
    ///
    /// Returns the PID, or `None` when the process is not configured.
    pub fn launch(&self, name: &str) -> anyhow::Result<Option<u32>> {
        let Some(spec) = self.spec_for(name)? else {
            log::info!("Process {} is not configured, skipping", name);
            return Ok(None);
        };

        let LaunchSpec { name, command, args } = spec;
        let pid = self.supervisor.start(&name, command, args)?;
        Ok(Some(pid))
    }

    /// Starts nezha, xray and the tunnel in order, pausing between launches.
    /// Failures are logged; the supervisor keeps retrying on its own.
    pub async fn launch_all(&self) {
        if self.nezha_enabled() {
            log::info!("🔧 Starting nezha agent...");
            if let Err(e) = self.launch(NEZHA) {
                log::error!("Failed to start nezha: {:#}", e);
            }
            tokio::time::sleep(LAUNCH_GAP).await;
        }

        log::info!("🛡️  Starting xray...");
        if let Err(e) = self.launch(XRAY) {
            log::error!("Failed to start xray: {:#}", e);
        }
        tokio::time::sleep(LAUNCH_GAP).await;

        log::info!("🌉 Starting tunnel...");
        if let Err(e) = self.launch(TUNNEL) {
            log::error!("Failed to start tunnel: {:#}", e);
        }
    }

    pub fn xray_spec(&self) -> anyhow::Result<LaunchSpec> {
        let config_path = self.render_xray_config()?;

        Ok(LaunchSpec::new(
            XRAY,
            self.path(XRAY_BINARY),
            vec!["-c".to_string(), config_path.display().to_string()],
        ))
    }

    pub fn render_xray_config(&self) -> anyhow::Result<PathBuf> {
        let config_path = self.path(XRAY_CONFIG_FILE);
        let data = serde_json::to_vec_pretty(&xray_config(&self.args.uuid))?;
        fs::write(&config_path, data)
            .with_context(|| format!("write {}", config_path.display()))?;
        Ok(config_path)
    }

    pub fn nezha_spec(&self) -> anyhow::Result<Option<LaunchSpec>> {
        if !self.nezha_enabled() {
            return Ok(None);
        }

        let args = &self.args;
        if !args.nezha_port.is_empty() {
            return Ok(Some(LaunchSpec::new(
                NEZHA,
                self.path(NEZHA_AGENT_BINARY),
                nezha_agent_args(&args.nezha_server, &args.nezha_port, &args.nezha_key),
            )));
        }

        let config_path = self.path(NEZHA_CONFIG_FILE);
        fs::write(
            &config_path,
            nezha_config_yaml(&args.nezha_key, &args.nezha_server, &args.uuid),
        )
        .with_context(|| format!("write {}", config_path.display()))?;

        Ok(Some(LaunchSpec::new(
            NEZHA,
            self.path(NEZHA_PHP_BINARY),
            vec!["-c".to_string(), config_path.display().to_string()],
        )))
    }

    /// Classifies the credentials, publishes the tunnel tags and builds the directive.
    ///
    /// Without a configured domain the last discovered one is kept until the
    /// domain monitor finds the new one.
    pub fn tunnel_spec(&self) -> anyhow::Result<LaunchSpec> {
        let tunnel_type = self.tunnel_type();
        let domain = if self.args.argo_domain.is_empty() {
            self.supervisor.tunnel_info().domain
        } else {
            self.args.argo_domain.clone()
        };
        self.supervisor.set_tunnel_info(tunnel_type.as_str(), &domain);

        let args = match tunnel_type {
            TunnelType::Fixed => {
                let config_path = self.prepare_fixed_tunnel()?;
                vec![
                    "tunnel".to_string(),
                    "--edge-ip-version".to_string(),
                    "auto".to_string(),
                    "--config".to_string(),
                    config_path.display().to_string(),
                    "run".to_string(),
                ]
            }
            TunnelType::Token => {
                let mut args = vec![
                    "tunnel".to_string(),
                    "--edge-ip-version".to_string(),
                    "auto".to_string(),
                    "--no-autoupdate".to_string(),
                    "--protocol".to_string(),
                    "http2".to_string(),
                    "run".to_string(),
                    "--token".to_string(),
                    self.args.argo_auth.clone(),
                ];
                if !self.args.argo_domain.is_empty() {
                    args.push("--hostname".to_string());
                    args.push(self.args.argo_domain.clone());
                }
                args
            }
            TunnelType::Temporary => {
                self.reset_tunnel_log()?;
                vec![
                    "tunnel".to_string(),
                    "--edge-ip-version".to_string(),
                    "auto".to_string(),
                    "--no-autoupdate".to_string(),
                    "--protocol".to_string(),
                    "http2".to_string(),
                    "--logfile".to_string(),
                    self.path(TUNNEL_LOG_FILE).display().to_string(),
                    "--loglevel".to_string(),
                    "info".to_string(),
                    "run".to_string(),
                    "--url".to_string(),
                    format!("http://localhost:{}", self.args.external_port),
                ]
            }
        };

        Ok(LaunchSpec::new(TUNNEL, self.path(TUNNEL_BINARY), args))
    }

    /// Empties the quick-tunnel log so the new hostname is the only one in it.
    fn reset_tunnel_log(&self) -> anyhow::Result<()> {
        let log_path = self.path(TUNNEL_LOG_FILE);
        fs::write(&log_path, b"").with_context(|| format!("truncate {}", log_path.display()))
    }

    /// Writes the credentials file and the ingress config of a named tunnel.
    fn prepare_fixed_tunnel(&self) -> anyhow::Result<PathBuf> {
        let credentials: FixedTunnelCredentials = serde_json::from_str(&self.args.argo_auth)
            .context("parse fixed tunnel credentials")?;

        let credentials_path = self.path(TUNNEL_CREDENTIALS_FILE);
        fs::write(&credentials_path, &self.args.argo_auth)
            .with_context(|| format!("write {}", credentials_path.display()))?;

        let config_path = self.path(TUNNEL_CONFIG_FILE);
        let yaml = fixed_tunnel_yaml(
            &credentials.tunnel_id,
            &credentials_path,
            &self.args.argo_domain,
            self.args.external_port,
        );
        fs::write(&config_path, yaml).with_context(|| format!("write {}", config_path.display()))?;

        Ok(config_path)
    }
}

fn sniffing() -> Value {
    json!({
        "enabled": true,
        "destOverride": ["http", "tls", "quic"],
        "metadataOnly": false
    })
}

/// Proxy core configuration: a vless entry point on 3001 falling back to
/// websocket inbounds for the tunnel paths.
pub fn xray_config(uuid: &str) -> Value {
    json!({
        "log": { "access": "/dev/null", "error": "/dev/null", "loglevel": "warning" },
        "dns": {
            "servers": [
                "https+local://8.8.8.8/dns-query",
                "https+local://1.1.1.1/dns-query",
                "8.8.8.8",
                "1.1.1.1"
            ],
            "queryStrategy": "UseIP",
            "disableCache": false
        },
        "inbounds": [
            {
                "port": 3001,
                "protocol": "vless",
                "settings": {
                    "clients": [{ "id": uuid, "flow": "xtls-rprx-vision" }],
                    "decryption": "none",
                    "fallbacks": [
                        { "dest": 3002 },
                        { "path": "/vless-argo", "dest": 3003 },
                        { "path": "/vmess-argo", "dest": 3004 },
                        { "path": "/trojan-argo", "dest": 3005 }
                    ]
                },
                "streamSettings": { "network": "tcp" }
            },
            {
                "port": 3002,
                "listen": "127.0.0.1",
                "protocol": "vless",
                "settings": { "clients": [{ "id": uuid }], "decryption": "none" },
                "streamSettings": {
                    "network": "tcp",
                    "security": "none",
                    "tcpSettings": { "header": { "type": "none" } }
                }
            },
            {
                "port": 3003,
                "listen": "127.0.0.1",
                "protocol": "vless",
                "settings": { "clients": [{ "id": uuid, "level": 0 }], "decryption": "none" },
                "streamSettings": {
                    "network": "ws",
                    "security": "none",
                    "wsSettings": { "path": "/vless-argo" }
                },
                "sniffing": sniffing()
            },
            {
                "port": 3004,
                "listen": "127.0.0.1",
                "protocol": "vmess",
                "settings": { "clients": [{ "id": uuid, "alterId": 0 }] },
                "streamSettings": { "network": "ws", "wsSettings": { "path": "/vmess-argo" } },
                "sniffing": sniffing()
            },
            {
                "port": 3005,
                "listen": "127.0.0.1",
                "protocol": "trojan",
                "settings": { "clients": [{ "password": uuid }] },
                "streamSettings": {
                    "network": "ws",
                    "security": "none",
                    "wsSettings": { "path": "/trojan-argo" }
                },
                "sniffing": sniffing()
            }
        ],
        "outbounds": [
            { "protocol": "freedom", "tag": "direct", "settings": { "domainStrategy": "UseIP" } },
            { "protocol": "blackhole", "tag": "block" }
        ],
        "routing": { "domainStrategy": "IPIfNonMatch", "rules": [] }
    })
}

pub fn nezha_agent_args(server: &str, port: &str, key: &str) -> Vec<String> {
    let mut args = vec![
        "-s".to_string(),
        format!("{}:{}", server, port),
        "-p".to_string(),
        key.to_string(),
        "--disable-auto-update".to_string(),
        "--report-delay".to_string(),
        "4".to_string(),
        "--skip-conn".to_string(),
        "--skip-procs".to_string(),
    ];

    if NEZHA_TLS_PORTS.contains(&port) {
        args.push("--tls".to_string());
    }
    args
}

pub fn nezha_config_yaml(key: &str, server: &str, uuid: &str) -> String {
    format!(
        "client_secret: {key}
debug: false
disable_auto_update: true
disable_command_execute: false
disable_force_update: true
disable_nat: false
disable_send_query: false
gpu: false
insecure_tls: true
ip_report_period: 1800
report_delay: 4
server: {server}
skip_connection_count: true
skip_procs_count: true
temperature: false
tls: true
use_gitee_to_upgrade: false
use_ipv6_country_code: false
uuid: {uuid}
"
    )
}

pub fn fixed_tunnel_yaml(
    tunnel_id: &str,
    credentials: &Path,
    hostname: &str,
    external_port: u16,
) -> String {
    format!(
        "tunnel: {tunnel_id}
credentials-file: {credentials}
protocol: http2

ingress:
  - hostname: {hostname}
    service: http://localhost:{external_port}
    originRequest:
      noTLSVerify: true
  - service: http_status:404
",
        credentials = credentials.display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonSettings;
    use clap::Parser;
    use tempfile::TempDir;

    fn launcher(dir: &TempDir, extra: &[&str]) -> Launcher {
        let mut argv = vec!["tunnel-daemon", "--file-path", dir.path().to_str().unwrap()];
        argv.extend_from_slice(extra);
        let args = Arc::new(CommandArgs::parse_from(argv));
        Launcher::new(args, Supervisor::new(DaemonSettings::default()))
    }

    #[test]
    fn test_xray_config_routes_tunnel_paths() {
        let config = xray_config("uuid-1");

        let fallbacks = config["inbounds"][0]["settings"]["fallbacks"].as_array().unwrap();
        assert_eq!(fallbacks.len(), 4);
        assert_eq!(fallbacks[1]["path"], "/vless-argo");
        assert_eq!(fallbacks[3]["dest"], 3005);

        let ports: Vec<u64> = config["inbounds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|inbound| inbound["port"].as_u64().unwrap())
            .collect();
        assert_eq!(ports, vec![3001, 3002, 3003, 3004, 3005]);
        assert_eq!(config["inbounds"][4]["settings"]["clients"][0]["password"], "uuid-1");
        assert_eq!(config["outbounds"][1]["protocol"], "blackhole");
    }

    #[test]
    fn test_xray_spec_renders_config_file() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir, &["--uuid", "abc"]);

        let spec = launcher.spec_for(XRAY).unwrap().unwrap();
        assert_eq!(spec.command, dir.path().join("xray"));
        assert_eq!(spec.args[0], "-c");

        let written: Value =
            serde_json::from_slice(&fs::read(dir.path().join(XRAY_CONFIG_FILE)).unwrap()).unwrap();
        assert_eq!(written["inbounds"][0]["settings"]["clients"][0]["id"], "abc");
    }

    #[test]
    fn test_nezha_agent_uses_tls_on_known_ports() {
        let args = nezha_agent_args("nz.example.com", "443", "secret");
        assert_eq!(args[1], "nz.example.com:443");
        assert_eq!(args.last().unwrap(), "--tls");

        let args = nezha_agent_args("nz.example.com", "5555", "secret");
        assert!(!args.contains(&"--tls".to_string()));
    }

    #[test]
    fn test_nezha_is_optional() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir, &["--nezha-server", "nz.example.com"]);

        assert!(!launcher.nezha_enabled());
        assert!(launcher.spec_for(NEZHA).unwrap().is_none());
    }

    #[test]
    fn test_nezha_without_port_renders_yaml() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(
            &dir,
            &["--nezha-server", "nz.example.com:8008", "--nezha-key", "k3y", "--uuid", "u-1"],
        );

        let spec = launcher.spec_for(NEZHA).unwrap().unwrap();
        assert_eq!(spec.command, dir.path().join(NEZHA_PHP_BINARY));

        let yaml = fs::read_to_string(dir.path().join(NEZHA_CONFIG_FILE)).unwrap();
        assert!(yaml.starts_with("client_secret: k3y\n"));
        assert!(yaml.contains("server: nz.example.com:8008\n"));
        assert!(yaml.contains("uuid: u-1\n"));
    }

    #[test]
    fn test_temporary_tunnel_logs_to_boot_log() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir, &["--external-port", "8080"]);

        let spec = launcher.tunnel_spec().unwrap();
        assert_eq!(spec.command, dir.path().join(TUNNEL_BINARY));
        assert!(spec.args.contains(&dir.path().join(TUNNEL_LOG_FILE).display().to_string()));
        assert_eq!(spec.args.last().unwrap(), "http://localhost:8080");
        assert_eq!(launcher.supervisor.tunnel_info().tunnel_type, "temporary");
    }

    #[test]
    fn test_temporary_relaunch_keeps_known_domain() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir, &["--argo-auth", "", "--argo-domain", ""]);
        launcher
            .supervisor
            .set_tunnel_info("temporary", "misty-lake-owl.trycloudflare.com");
        fs::write(
            dir.path().join(TUNNEL_LOG_FILE),
            "INF |  https://misty-lake-owl.trycloudflare.com  |\n",
        )
        .unwrap();

        launcher.tunnel_spec().unwrap();

        let info = launcher.supervisor.tunnel_info();
        assert_eq!(info.tunnel_type, "temporary");
        assert_eq!(info.domain, "misty-lake-owl.trycloudflare.com");
        assert_eq!(fs::read_to_string(dir.path().join(TUNNEL_LOG_FILE)).unwrap(), "");
    }

    #[test]
    fn test_token_tunnel_passes_hostname() {
        let dir = TempDir::new().unwrap();
        let token = "e".repeat(180);
        let launcher = launcher(&dir, &["--argo-auth", &token, "--argo-domain", "node.example.com"]);

        let spec = launcher.tunnel_spec().unwrap();
        let token_at = spec.args.iter().position(|a| a == "--token").unwrap();
        assert_eq!(spec.args[token_at + 1], token);
        assert_eq!(spec.args[spec.args.len() - 2..], ["--hostname", "node.example.com"]);

        let info = launcher.supervisor.tunnel_info();
        assert_eq!(info.tunnel_type, "token");
        assert_eq!(info.domain, "node.example.com");
    }

    #[test]
    fn test_fixed_tunnel_writes_ingress() {
        let dir = TempDir::new().unwrap();
        let auth = r#"{"AccountTag":"acc","TunnelSecret":"s3cr3t","TunnelID":"tid-42"}"#;
        let launcher = launcher(&dir, &["--argo-auth", auth, "--argo-domain", "node.example.com"]);

        let spec = launcher.tunnel_spec().unwrap();
        assert!(spec.args.contains(&"--config".to_string()));

        let yaml = fs::read_to_string(dir.path().join(TUNNEL_CONFIG_FILE)).unwrap();
        assert!(yaml.contains("tunnel: tid-42\n"));
        assert!(yaml.contains("hostname: node.example.com\n"));
        assert!(yaml.contains("service: http://localhost:7860\n"));
        assert_eq!(
            fs::read_to_string(dir.path().join(TUNNEL_CREDENTIALS_FILE)).unwrap(),
            auth
        );
    }

    #[test]
    fn test_fixed_tunnel_without_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir, &["--argo-auth", r#"{"TunnelSecret":"s3cr3t"}"#]);
        assert!(launcher.tunnel_spec().is_err());
    }

    #[test]
    fn test_unknown_process_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(launcher(&dir, &[]).spec_for("caddy").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_starts_supervised_process() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let binary = dir.path().join(XRAY_BINARY);
        fs::write(&binary, "#!/bin/sh\nexec sleep 5\n").unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();

        let launcher = launcher(&dir, &[]);
        let pid = launcher.launch(XRAY).unwrap().unwrap();

        let status = launcher.supervisor.status();
        assert_eq!(status.processes.get(XRAY).unwrap().pid, Some(pid));
        assert!(status.processes.get(XRAY).unwrap().running);
        assert_eq!(launcher.launch(NEZHA).unwrap(), None);

        launcher.supervisor.shutdown().await;
    }
}
