use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use std::fs;
use std::path::PathBuf;

use crate::cli::CommandArgs;

pub const SUBSCRIPTION_FILE: &str = "sub.txt";
pub const DEFAULT_NODE_NAME: &str = "TunnelNode";

/// Plain-text share links (vless, vmess, trojan) for the tunnel `domain`.
pub fn share_links(args: &CommandArgs, domain: &str) -> anyhow::Result<String> {
    if domain.is_empty() {
        bail!("tunnel domain is empty");
    }

    let node = if args.name.is_empty() {
        DEFAULT_NODE_NAME
    } else {
        args.name.as_str()
    };
    let (uuid, cf_ip, cf_port) = (&args.uuid, &args.cf_ip, args.cf_port);

    let vless = format!(
        "vless://{uuid}@{cf_ip}:{cf_port}?encryption=none&security=tls&sni={domain}&fp=firefox&type=ws&host={domain}&path=%2Fvless-argo%3Fed%3D2560#{node}"
    );

    let vmess_json = json!({
        "v": "2",
        "ps": node,
        "add": cf_ip,
        "port": cf_port,
        "id": uuid,
        "aid": "0",
        "scy": "none",
        "net": "ws",
        "type": "none",
        "host": domain,
        "path": "/vmess-argo?ed=2560",
        "tls": "tls",
        "sni": domain,
        "fp": "firefox"
    });
    let vmess = format!(
        "vmess://{}",
        BASE64.encode(serde_json::to_vec(&vmess_json).context("serialize vmess node")?)
    );

    let trojan = format!(
        "trojan://{uuid}@{cf_ip}:{cf_port}?security=tls&sni={domain}&fp=firefox&type=ws&host={domain}&path=%2Ftrojan-argo%3Fed%3D2560#{node}"
    );

    Ok(format!("{}\n{}\n{}", vless, vmess, trojan))
}

/// Renders the base64 subscription into `<FILE_PATH>/sub.txt`.
pub fn generate(args: &CommandArgs, domain: &str) -> anyhow::Result<PathBuf> {
    let encoded = BASE64.encode(share_links(args, domain)?);
    let path = args.file_path.join(SUBSCRIPTION_FILE);

    fs::write(&path, encoded).with_context(|| format!("write {}", path.display()))?;
    log::info!("✓ Subscription written for {}", domain);
    Ok(path)
}
