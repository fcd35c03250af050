use anyhow::{bail, Context};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::CommandArgs;
use crate::config::STATUS_FILE_NAME;
use crate::services::launcher::{NEZHA_AGENT_BINARY, NEZHA_PHP_BINARY, TUNNEL_BINARY, XRAY_BINARY};
use crate::services::subscription::SUBSCRIPTION_FILE;

/// A vendor binary: local file name and the remote asset it is fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Asset {
    pub file_name: &'static str,
    pub remote: &'static str,
}

/// Download host prefix for the running CPU.
pub fn architecture() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" | "arm" => "arm64",
        _ => "amd64",
    }
}

/// Binaries needed for the configured processes.
pub fn assets_for(args: &CommandArgs) -> Vec<Asset> {
    let mut assets = vec![
        Asset { file_name: XRAY_BINARY, remote: "web" },
        Asset { file_name: TUNNEL_BINARY, remote: "bot" },
    ];

    if !args.nezha_server.is_empty() && !args.nezha_key.is_empty() {
        assets.push(if args.nezha_port.is_empty() {
            Asset { file_name: NEZHA_PHP_BINARY, remote: "v1" }
        } else {
            Asset { file_name: NEZHA_AGENT_BINARY, remote: "agent" }
        });
    }
    assets
}

/// Fetches vendor binaries into the working directory.
pub struct Downloader {
    client: reqwest::Client,
    dir: PathBuf,
    base_url: String,
}

impl Downloader {
    pub fn from_args(args: &CommandArgs) -> anyhow::Result<Self> {
        let base_url = format!("https://{}.{}", architecture(), args.download_host);
        Self::with_base_url(&args.file_path, base_url)
    }

    pub fn with_base_url(dir: &Path, base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("build HTTP client")?;

        Ok(Self {
            client,
            dir: dir.to_path_buf(),
            base_url: base_url.into(),
        })
    }

    pub fn asset_url(&self, asset: &Asset) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), asset.remote)
    }

    /// Downloads every missing asset; stops at the first failure.
    pub async fn download_all(&self, assets: &[Asset]) -> anyhow::Result<()> {
        for asset in assets {
            self.download(asset).await?;
        }
        Ok(())
    }

    /// Returns false when the file was already present.
    pub async fn download(&self, asset: &Asset) -> anyhow::Result<bool> {
        let target = self.dir.join(asset.file_name);
        if target.exists() {
            log::info!("File already present: {}", asset.file_name);
            return Ok(false);
        }

        let url = self.asset_url(asset);
        log::info!("📥 Downloading {} from {}", asset.file_name, url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("download {}", asset.file_name))?;

        if response.status() != reqwest::StatusCode::OK {
            bail!("download {} failed: HTTP {}", asset.file_name, response.status());
        }

        let body = response
            .bytes()
            .await
            .with_context(|| format!("read body of {}", asset.file_name))?;
        tokio::fs::write(&target, &body)
            .await
            .with_context(|| format!("write {}", target.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&target, fs::Permissions::from_mode(0o755))
                .await
                .with_context(|| format!("chmod {}", target.display()))?;
        }

        log::info!("✓ Downloaded {} ({} bytes)", asset.file_name, body.len());
        Ok(true)
    }
}

fn keep_on_cleanup(file_name: &str) -> bool {
    file_name == STATUS_FILE_NAME
        || file_name == SUBSCRIPTION_FILE
        || file_name.ends_with(".json")
        || file_name.ends_with(".yaml")
        || file_name.ends_with(".yml")
}

/// Removes stale runtime files, keeping caches and rendered configs.
/// Returns how many files were deleted.
pub fn cleanup_old_files(dir: &Path) -> anyhow::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("read {}", dir.display())),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let file_name = entry.file_name();
        if keep_on_cleanup(&file_name.to_string_lossy()) {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => log::warn!("Failed to remove {}: {}", entry.path().display(), e),
        }
    }

    Ok(removed)
}
