use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Tunnel Daemon - supervises the proxy core, the tunnel client and the monitoring agent
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct CommandArgs {
    /// Control surface listen port
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Control surface listen address
    #[arg(short = 'a', long, env = "ADDRESS", default_value = "0.0.0.0")]
    pub address: String,

    /// Port the tunnel forwards public traffic to
    #[arg(long, env = "EXTERNAL_PORT", default_value_t = 7860)]
    pub external_port: u16,

    /// Working directory for binaries, rendered configs and runtime files
    #[arg(long, env = "FILE_PATH", default_value = "./tmp")]
    pub file_path: PathBuf,

    /// URL path the subscription is served under
    #[arg(long, env = "SUB_PATH", default_value = "sub")]
    pub sub_path: String,

    #[arg(long, env = "UUID", default_value = "35461c1b-c9fb-efd5-e5d4-cf754d37bd4b")]
    pub uuid: String,

    /// URL periodically visited to keep the hosting project awake
    #[arg(long, env = "PROJECT_URL")]
    pub project_url: Option<String>,

    #[arg(long, env = "AUTO_ACCESS", default_value_t = false, action = ArgAction::Set)]
    pub auto_access: bool,

    #[arg(long, env = "NEZHA_SERVER", default_value = "")]
    pub nezha_server: String,

    /// Agent port; when empty the php-flavoured agent is used with a rendered config
    #[arg(long, env = "NEZHA_PORT", default_value = "")]
    pub nezha_port: String,

    #[arg(long, env = "NEZHA_KEY", default_value = "")]
    pub nezha_key: String,

    /// Fixed tunnel hostname
    #[arg(long, env = "ARGO_DOMAIN", default_value = "")]
    pub argo_domain: String,

    /// Tunnel credentials: JSON secret or token; empty means a temporary tunnel
    #[arg(long, env = "ARGO_AUTH", default_value = "")]
    pub argo_auth: String,

    /// Preferred edge address written into subscription links
    #[arg(long, env = "CFIP", default_value = "cdns.doon.eu.org")]
    pub cf_ip: String,

    #[arg(long, env = "CFPORT", default_value_t = 443)]
    pub cf_port: u16,

    /// Node name shown in subscription links
    #[arg(long, env = "NAME", default_value = "")]
    pub name: String,

    /// Health check interval in milliseconds
    #[arg(long, env = "DAEMON_CHECK_INTERVAL", default_value_t = 30_000)]
    pub daemon_check_interval: u64,

    /// Automatic restarts allowed before a process is marked permanently failed
    #[arg(long, env = "DAEMON_MAX_RETRIES", default_value_t = 5)]
    pub daemon_max_retries: u32,

    /// Base restart delay in milliseconds, doubled on every retry
    #[arg(long, env = "DAEMON_RESTART_DELAY", default_value_t = 10_000)]
    pub daemon_restart_delay: u64,

    /// Host serving the vendor binaries, prefixed with the architecture
    #[arg(long, env = "DOWNLOAD_HOST", default_value = "ssss.nyc.mn")]
    pub download_host: String,

    /// Use binaries already present in FILE_PATH instead of downloading them
    #[arg(long, env = "SKIP_DOWNLOAD", default_value_t = false, action = ArgAction::Set)]
    pub skip_download: bool,
}
