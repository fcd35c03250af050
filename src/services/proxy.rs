use anyhow::{bail, Context};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::cli::CommandArgs;

/// vless entry point of the proxy core, see `launcher::xray_config`.
pub const XRAY_ENTRY_PORT: u16 = 3001;

/// Websocket paths handed to the proxy core.
const TUNNEL_PATH_PREFIXES: [&str; 3] = ["/vless-argo", "/vmess-argo", "/trojan-argo"];
const TUNNEL_PATHS: [&str; 3] = ["/vless", "/vmess", "/trojan"];

const MAX_HEAD_SIZE: usize = 16 * 1024;

const BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    /// Proxy core on [`XRAY_ENTRY_PORT`]
    Xray,
    /// The daemon's own HTTP server
    Control,
}

/// Picks the upstream for a request target, ignoring the query string.
pub fn route(target: &str) -> Upstream {
    let path = target.split('?').next().unwrap_or(target);

    if TUNNEL_PATH_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
        || TUNNEL_PATHS.contains(&path)
    {
        Upstream::Xray
    } else {
        Upstream::Control
    }
}

/// Parsed request line and headers of one HTTP/1.x request.
#[derive(Debug)]
struct RequestHead {
    request_line: String,
    target: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn parse(head: &str) -> anyhow::Result<Self> {
        let mut lines = head.split("\r\n").filter(|line| !line.is_empty());
        let request_line = lines.next().context("empty request")?.to_string();

        let mut parts = request_line.split_whitespace();
        let (Some(_method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            bail!("malformed request line '{}'", request_line);
        };
        if !version.starts_with("HTTP/1.") {
            bail!("unsupported protocol '{}'", version);
        }
        let target = target.to_string();

        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect();

        Ok(Self {
            request_line,
            target,
            headers,
        })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn is_upgrade(&self) -> bool {
        self.header("upgrade").is_some()
            && self
                .header("connection")
                .is_some_and(|value| value.to_ascii_lowercase().contains("upgrade"))
    }

    /// Head as sent upstream: `Host` points at the upstream and plain
    /// requests close the connection after one exchange.
    fn rewrite(&self, upstream: SocketAddr) -> String {
        let upgrade = self.is_upgrade();
        let mut out = format!("{}\r\n", self.request_line);

        for (name, value) in &self.headers {
            let hop_by_hop = ["connection", "keep-alive", "proxy-connection"]
                .iter()
                .any(|h| name.eq_ignore_ascii_case(h));
            if name.eq_ignore_ascii_case("host") || (hop_by_hop && !upgrade) {
                continue;
            }
            out.push_str(&format!("{}: {}\r\n", name, value));
        }

        out.push_str(&format!("Host: {}\r\n", upstream));
        if let Some(host) = self.header("host") {
            out.push_str(&format!("X-Forwarded-Host: {}\r\n", host));
        }
        if !upgrade {
            out.push_str("Connection: close\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

/// Reads until the end of the request head; returns the head and whatever
/// body bytes arrived with it.
async fn read_head(stream: &mut TcpStream) -> anyhow::Result<(String, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            let head = String::from_utf8(buf).context("request head is not UTF-8")?;
            return Ok((head, rest));
        }
        if buf.len() > MAX_HEAD_SIZE {
            bail!("request head exceeds {} bytes", MAX_HEAD_SIZE);
        }

        let n = stream.read(&mut chunk).await.context("read request head")?;
        if n == 0 {
            bail!("connection closed before the request head was complete");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Front door on `EXTERNAL_PORT`: tunnel websocket paths go to the proxy
/// core, everything else to the control server.
#[derive(Debug, Clone)]
pub struct ExternalProxy {
    xray: SocketAddr,
    control: SocketAddr,
}

impl ExternalProxy {
    pub fn new(xray: SocketAddr, control: SocketAddr) -> Self {
        Self { xray, control }
    }

    pub fn from_args(args: &CommandArgs) -> Self {
        Self::new(
            SocketAddr::from((Ipv4Addr::LOCALHOST, XRAY_ENTRY_PORT)),
            SocketAddr::from((Ipv4Addr::LOCALHOST, args.port)),
        )
    }

    fn upstream_addr(&self, upstream: Upstream) -> SocketAddr {
        match upstream {
            Upstream::Xray => self.xray,
            Upstream::Control => self.control,
        }
    }

    /// Accepts connections until `cancel` fires.
    pub async fn run(self, listener: TcpListener, cancel: CancellationToken) {
        let proxy = Arc::new(self);

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let proxy = proxy.clone();
                    tokio::spawn(async move {
                        if let Err(e) = proxy.relay(stream).await {
                            log::debug!("Proxy connection from {} ended: {:#}", peer, e);
                        }
                    });
                }
                Err(e) => log::warn!("Proxy accept failed: {}", e),
            }
        }

        log::info!("External proxy stopped");
    }

    async fn relay(&self, mut inbound: TcpStream) -> anyhow::Result<()> {
        let (head, rest) = read_head(&mut inbound).await?;
        let request = RequestHead::parse(&head)?;
        let upstream = self.upstream_addr(route(&request.target));

        let mut outbound = match TcpStream::connect(upstream).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = inbound.write_all(BAD_GATEWAY).await;
                return Err(e).with_context(|| format!("connect {}", upstream));
            }
        };

        outbound.write_all(request.rewrite(upstream).as_bytes()).await?;
        outbound.write_all(&rest).await?;
        copy_bidirectional(&mut inbound, &mut outbound)
            .await
            .with_context(|| format!("relay to {}", upstream))?;
        Ok(())
    }
}
