use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Default single-probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckKind {
    /// Path exists
    File,
    /// `host:port`, or a bare port on localhost, accepts a connection
    Tcp,
    /// GET returns a 2xx status
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(rename = "type")]
    pub kind: HealthCheckKind,
    pub target: String,
    pub interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl HealthCheckConfig {
    pub fn file(path: impl Into<String>, interval_ms: u64) -> Self {
        Self {
            kind: HealthCheckKind::File,
            target: path.into(),
            interval_ms,
            timeout_ms: None,
        }
    }

    pub fn tcp(target: impl Into<String>, interval_ms: u64) -> Self {
        Self {
            kind: HealthCheckKind::Tcp,
            target: target.into(),
            interval_ms,
            timeout_ms: None,
        }
    }

    pub fn http(url: impl Into<String>, interval_ms: u64) -> Self {
        Self {
            kind: HealthCheckKind::Http,
            target: url.into(),
            interval_ms,
            timeout_ms: None,
        }
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PROBE_TIMEOUT)
    }
}

/// Latest probe result. Independent of the service lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl From<bool> for HealthStatus {
    fn from(healthy: bool) -> Self {
        if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Runs single health probes
#[derive(Clone)]
pub struct HealthProber {
    http: reqwest::Client,
}

impl HealthProber {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// One probe. Every failure, including a timeout, is just `false`.
    pub async fn probe(&self, config: &HealthCheckConfig) -> bool {
        let timeout = config.timeout();
        let healthy = match config.kind {
            HealthCheckKind::File => tokio::fs::metadata(&config.target).await.is_ok(),
            HealthCheckKind::Tcp => probe_tcp(&config.target, timeout).await,
            HealthCheckKind::Http => self.probe_http(&config.target, timeout).await,
        };
        trace!(kind = ?config.kind, target = %config.target, healthy, "Health probe");
        healthy
    }

    async fn probe_http(&self, url: &str, timeout: Duration) -> bool {
        match self.http.get(url).timeout(timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("HTTP health probe {} failed: {}", url, e);
                false
            }
        }
    }
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a TCP target into host and port
fn tcp_address(target: &str) -> Option<(String, u16)> {
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => ("localhost", target),
    };
    let port = port.trim().parse().ok()?;
    let host = if host.is_empty() { "localhost" } else { host };
    Some((host.to_string(), port))
}

async fn probe_tcp(target: &str, timeout: Duration) -> bool {
    let Some((host, port)) = tcp_address(target) else {
        debug!("Invalid TCP health target: {}", target);
        return false;
    };
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_address_forms() {
        assert_eq!(tcp_address("8080"), Some(("localhost".into(), 8080)));
        assert_eq!(tcp_address("127.0.0.1:22"), Some(("127.0.0.1".into(), 22)));
        assert_eq!(tcp_address(":9000"), Some(("localhost".into(), 9000)));
        assert_eq!(tcp_address("host:notaport"), None);
    }

    #[test]
    fn test_config_wire_shape() {
        let config: HealthCheckConfig = serde_json::from_value(serde_json::json!({
            "type": "http",
            "target": "http://localhost:3000/health",
            "intervalMs": 5000
        }))
        .unwrap();
        assert_eq!(config.kind, HealthCheckKind::Http);
        assert_eq!(config.timeout(), DEFAULT_PROBE_TIMEOUT);
        assert_eq!(config.interval(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_file_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready");
        let config = HealthCheckConfig::file(path.display().to_string(), 100);
        let prober = HealthProber::new();

        assert!(!prober.probe(&config).await);
        std::fs::write(&path, b"ok").unwrap();
        assert!(prober.probe(&config).await);
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = HealthProber::new();

        let open = HealthCheckConfig::tcp(format!("127.0.0.1:{}", port), 100).timeout_ms(500);
        assert!(prober.probe(&open).await);

        drop(listener);
        assert!(!prober.probe(&open).await);
    }

    #[tokio::test]
    async fn test_http_probe_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config =
            HealthCheckConfig::http(format!("http://127.0.0.1:{}/health", port), 100).timeout_ms(500);
        assert!(!HealthProber::new().probe(&config).await);
    }
}
