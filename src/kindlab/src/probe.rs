//! Traffic checks through the Gateway: route probes, canary sampling and
//! hosts-file entries for the demo hostnames.
//!
//! Requests go straight to the gateway address with a `Host` header, so the
//! probes work before (or without) any DNS setup. Redirects are never followed:
//! a redirect route is verified by its status code.

use crate::config::{ProbeConfig, RouteCheck};
use crate::error::{LabError, Result};
use reqwest::header::HOST;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Response header the demo backends use to announce their version.
pub const VERSION_HEADER: &str = "x-app-version";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub check: RouteCheck,
    pub status: Option<u16>,
    pub location: Option<String>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn passed(&self) -> bool {
        self.status == Some(self.check.expect_status)
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed() { "PASS" } else { "FAIL" };
        write!(
            f,
            "{} {}{} expected {}",
            verdict, self.check.host, self.check.path, self.check.expect_status
        )?;
        match (&self.status, &self.error) {
            (Some(status), _) => write!(f, ", got {}", status)?,
            (None, Some(error)) => write!(f, ", error: {}", error)?,
            (None, None) => {}
        }
        if let Some(location) = &self.location {
            write!(f, " -> {}", location)?;
        }
        Ok(())
    }
}

/// Version distribution observed by [`RouteProbe::run_canary`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanaryTally {
    pub counts: BTreeMap<String, usize>,
    pub errors: usize,
}

impl CanaryTally {
    pub fn record(&mut self, version: &str) {
        *self.counts.entry(version.to_string()).or_insert(0) += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum::<usize>() + self.errors
    }

    /// Share of all requests per version, in percent.
    pub fn percentages(&self) -> Vec<(String, f64)> {
        let total = self.total();
        if total == 0 {
            return Vec::new();
        }
        self.counts
            .iter()
            .map(|(version, count)| (version.clone(), *count as f64 * 100.0 / total as f64))
            .collect()
    }
}

impl fmt::Display for CanaryTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} request(s)", self.total())?;
        for ((version, pct), count) in self.percentages().iter().zip(self.counts.values()) {
            writeln!(f, "  {:<16} {:>5} ({:.1}%)", version, count, pct)?;
        }
        if self.errors > 0 {
            writeln!(f, "  {:<16} {:>5}", "errors", self.errors)?;
        }
        Ok(())
    }
}

/// Version a canary backend answered with: the version header if present,
/// else the first line of the body.
pub fn response_version(header: Option<&str>, body: &str) -> String {
    header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .or_else(|| body.lines().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or("unknown")
        .to_string()
}

pub struct RouteProbe {
    client: reqwest::Client,
    address: String,
}

impl RouteProbe {
    /// `address` is the gateway IP, optionally with `:port`.
    pub fn new(address: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            address: address.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("http://{}{}", self.address, path)
        } else {
            format!("http://{}/{}", self.address, path)
        }
    }

    async fn get(&self, host: &str, path: &str) -> Result<reqwest::Response> {
        Ok(self
            .client
            .get(self.url(path))
            .header(HOST, host)
            .send()
            .await?)
    }

    pub async fn probe(&self, check: &RouteCheck) -> ProbeResult {
        match self.get(&check.host, &check.path).await {
            Ok(response) => ProbeResult {
                check: check.clone(),
                status: Some(response.status().as_u16()),
                location: response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from),
                error: None,
            },
            Err(e) => ProbeResult {
                check: check.clone(),
                status: None,
                location: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn probe_routes(&self, routes: &[RouteCheck]) -> Vec<ProbeResult> {
        let mut results = Vec::with_capacity(routes.len());
        for check in routes {
            let result = self.probe(check).await;
            if result.passed() {
                tracing::info!("[RouteProbe] {}", result);
            } else {
                tracing::warn!("[RouteProbe] {}", result);
            }
            results.push(result);
        }
        results
    }

    /// Send `config.canary_requests` requests to the canary host and count
    /// which version answered each one.
    pub async fn run_canary(&self, config: &ProbeConfig) -> Result<CanaryTally> {
        if config.canary_requests == 0 {
            return Err(LabError::Probe("canary needs at least one request".to_string()));
        }

        let mut tally = CanaryTally::default();
        for _ in 0..config.canary_requests {
            match self.get(&config.canary_host, &config.canary_path).await {
                Ok(response) if response.status().is_success() => {
                    let header = response
                        .headers()
                        .get(VERSION_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .map(String::from);
                    let body = response.text().await.unwrap_or_default();
                    tally.record(&response_version(header.as_deref(), &body));
                }
                Ok(response) => {
                    tracing::debug!("[RouteProbe] canary answered {}", response.status());
                    tally.record_error();
                }
                Err(e) => {
                    tracing::debug!("[RouteProbe] canary request failed: {}", e);
                    tally.record_error();
                }
            }
        }

        if tally.errors == tally.total() {
            return Err(LabError::Probe(format!(
                "all {} request(s) to {} failed",
                tally.errors, config.canary_host
            )));
        }
        Ok(tally)
    }
}

/// `<address>\t<hostname>` lines for every hostname.
pub fn hosts_lines(address: &str, hostnames: &[String]) -> Vec<String> {
    hostnames
        .iter()
        .map(|host| format!("{}\t{}", address, host))
        .collect()
}

/// Hostnames that have no entry in `contents` (hosts-file syntax).
pub fn missing_hosts<'a>(contents: &str, hostnames: &'a [String]) -> Vec<&'a str> {
    let present: Vec<&str> = contents
        .lines()
        .map(|l| l.split('#').next().unwrap_or_default().trim())
        .filter(|l| !l.is_empty())
        .flat_map(|l| l.split_whitespace().skip(1))
        .collect();
    hostnames
        .iter()
        .map(String::as_str)
        .filter(|host| !present.contains(host))
        .collect()
}

/// Append entries for hostnames not yet present in the hosts file at `path`.
/// Returns how many were added.
pub fn add_hosts_entries(path: &Path, address: &str, hostnames: &[String]) -> Result<usize> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let missing = missing_hosts(&contents, hostnames);
    if missing.is_empty() {
        return Ok(0);
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    if !contents.is_empty() && !contents.ends_with('\n') {
        writeln!(file)?;
    }
    for host in &missing {
        writeln!(file, "{}\t{}", address, host)?;
        tracing::info!("[Hosts] Added {} -> {} to {}", host, address, path.display());
    }
    Ok(missing.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `response` verbatim to every connection.
    async fn canned_server(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        address
    }

    #[tokio::test]
    async fn test_redirect_is_not_followed() {
        let address = canned_server(
            "HTTP/1.1 301 Moved Permanently\r\nLocation: https://shop.lab.local/\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let probe = RouteProbe::new(address, Duration::from_secs(5)).unwrap();
        let check = RouteCheck {
            host: "legacy.lab.local".into(),
            path: "/".into(),
            expect_status: 301,
        };
        let result = probe.probe(&check).await;
        assert!(result.passed(), "{}", result);
        assert_eq!(result.location.as_deref(), Some("https://shop.lab.local/"));
    }

    #[tokio::test]
    async fn test_canary_counts_versions() {
        let address = canned_server(
            "HTTP/1.1 200 OK\r\nx-app-version: v2\r\nContent-Length: 6\r\nConnection: close\r\n\r\nhello\n",
        )
        .await;
        let probe = RouteProbe::new(address, Duration::from_secs(5)).unwrap();
        let config = ProbeConfig {
            canary_requests: 3,
            ..Default::default()
        };
        let tally = probe.run_canary(&config).await.unwrap();
        assert_eq!(tally.counts.get("v2"), Some(&3));
        assert_eq!(tally.errors, 0);
    }

    #[tokio::test]
    async fn test_unreachable_gateway_fails_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let probe = RouteProbe::new(address, Duration::from_secs(2)).unwrap();
        let result = probe
            .probe(&RouteCheck {
                host: "shop.lab.local".into(),
                path: "/".into(),
                expect_status: 200,
            })
            .await;
        assert!(!result.passed());
        assert!(result.error.is_some());
    }

    #[test]
    fn test_canary_percentages() {
        let mut tally = CanaryTally::default();
        for _ in 0..3 {
            tally.record("v1");
        }
        tally.record("v2");
        assert_eq!(
            tally.percentages(),
            vec![("v1".to_string(), 75.0), ("v2".to_string(), 25.0)]
        );
        assert!(CanaryTally::default().percentages().is_empty());
    }

    #[test]
    fn test_response_version() {
        assert_eq!(response_version(Some("v2"), "ignored"), "v2");
        assert_eq!(response_version(None, "\ncanary-v1\n"), "canary-v1");
        assert_eq!(response_version(Some(" "), ""), "unknown");
    }

    #[test]
    fn test_hosts_entries_are_appended_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(
            &path,
            "127.0.0.1 localhost\n# 10.0.0.1 canary.lab.local\n10.0.0.9 shop.lab.local",
        )
        .unwrap();
        let hostnames = vec![
            "shop.lab.local".to_string(),
            "canary.lab.local".to_string(),
            "legacy.lab.local".to_string(),
        ];

        assert_eq!(add_hosts_entries(&path, "172.18.255.200", &hostnames).unwrap(), 2);
        assert_eq!(add_hosts_entries(&path, "172.18.255.200", &hostnames).unwrap(), 0);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("10.0.0.9 shop.lab.local\n172.18.255.200\tcanary.lab.local\n"));
        assert!(contents.ends_with("172.18.255.200\tlegacy.lab.local\n"));
    }

    #[test]
    fn test_hosts_lines() {
        assert_eq!(
            hosts_lines("172.18.255.200", &["a.lab.local".to_string()]),
            vec!["172.18.255.200\ta.lab.local"]
        );
    }
}
