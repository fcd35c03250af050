use anyhow::Context;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cli::CommandArgs;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Periodically visits the hosting project's URL so the platform keeps it awake.
pub struct Keepalive {
    client: reqwest::Client,
    url: String,
    interval: Duration,
}

impl Keepalive {
    /// `None` unless auto access is on and a project URL is configured.
    pub fn from_args(args: &CommandArgs) -> anyhow::Result<Option<Self>> {
        match &args.project_url {
            Some(url) if args.auto_access && !url.is_empty() => {
                Self::with_interval(url, KEEPALIVE_INTERVAL).map(Some)
            }
            _ => Ok(None),
        }
    }

    pub fn with_interval(url: &str, interval: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build HTTP client")?;

        Ok(Self {
            client,
            url: url.to_string(),
            interval,
        })
    }

    pub async fn ping(&self) -> anyhow::Result<reqwest::StatusCode> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("visit {}", self.url))?;
        Ok(response.status())
    }

    /// Visits the URL once per interval until `cancel` fires; the first visit
    /// happens one interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        log::info!("⏰ Auto access enabled for {} every {:?}", self.url, self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.ping().await {
                Ok(status) => log::debug!("Auto access {} -> {}", self.url, status),
                Err(e) => log::error!("Auto access failed: {:#}", e),
            }
        }

        log::debug!("Auto access stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn counting_server(hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 2048];
                let _ = socket.read(&mut buf).await;
                hits.fetch_add(1, Ordering::SeqCst);
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                    .await;
                let _ = socket.shutdown().await;
            }
        });

        format!("http://{}/", addr)
    }

    #[test]
    fn test_requires_flag_and_url() {
        let args = CommandArgs::parse_from(["tunnel-daemon", "--project-url", "https://app.example.com"]);
        assert!(Keepalive::from_args(&args).unwrap().is_none());

        let args = CommandArgs::parse_from(["tunnel-daemon", "--auto-access", "true"]);
        assert!(Keepalive::from_args(&args).unwrap().is_none());

        let args = CommandArgs::parse_from([
            "tunnel-daemon",
            "--auto-access",
            "true",
            "--project-url",
            "https://app.example.com",
        ]);
        let keepalive = Keepalive::from_args(&args).unwrap().unwrap();
        assert_eq!(keepalive.interval, KEEPALIVE_INTERVAL);
    }

    #[tokio::test]
    async fn test_visits_until_cancelled() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = counting_server(hits.clone()).await;
        let keepalive = Keepalive::with_interval(&url, Duration::from_millis(100)).unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(keepalive.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(450)).await;
        cancel.cancel();
        task.await.unwrap();

        let seen = hits.load(Ordering::SeqCst);
        assert!(seen >= 2, "only {} visits", seen);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(hits.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_ping_reports_status() {
        let url = counting_server(Arc::new(AtomicUsize::new(0))).await;
        let keepalive = Keepalive::with_interval(&url, KEEPALIVE_INTERVAL).unwrap();
        assert_eq!(keepalive.ping().await.unwrap(), reqwest::StatusCode::OK);
    }
}
