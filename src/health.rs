//! Instance health tracking and health-strategy filtering.
//!
//! The watcher keeps a map of IP -> healthiness and periodically probes every
//! tracked IP against its instance health endpoint. `is_healthy` and
//! `untrack` are idempotent; observations are point-in-time and follow the
//! polling cadence.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::DnsError;
use crate::metrics;
use crate::shutdown::ShutdownSignal;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Health filtering strategy selected by criterion `s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStrategy {
    /// `1`: unhealthy instances only.
    Unhealthy,
    /// `3`: healthy instances only.
    Healthy,
    /// `4`: healthy followed by unhealthy.
    All,
    /// Absent, `0`, or anything else: healthy when any exist, else unhealthy.
    Smart,
}

impl HealthStrategy {
    /// Decode the strategy from the criterion value.
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            Some("1") => Self::Unhealthy,
            Some("3") => Self::Healthy,
            Some("4") => Self::All,
            _ => Self::Smart,
        }
    }

    /// Apply the strategy to a healthy/unhealthy partition.
    pub fn filter(self, healthy: Vec<String>, unhealthy: Vec<String>) -> Vec<String> {
        match self {
            Self::Unhealthy => unhealthy,
            Self::Healthy => healthy,
            Self::All => {
                let mut all = healthy;
                all.extend(unhealthy);
                all
            }
            Self::Smart => {
                if healthy.is_empty() {
                    unhealthy
                } else {
                    healthy
                }
            }
        }
    }
}

/// Live healthiness answers for resolved IPs.
pub trait HealthWatcher: Send + Sync {
    /// Whether the IP currently counts as healthy. Asking about an unknown
    /// IP subscribes the watcher to it.
    fn is_healthy(&self, ip: &str) -> bool;

    /// Stop tracking an IP. A no-op for unknown IPs.
    fn untrack(&self, ip: &str);
}

/// Watcher used when health filtering is disabled: everything is healthy and
/// nothing is tracked.
#[derive(Debug, Default)]
pub struct NopHealthWatcher;

impl HealthWatcher for NopHealthWatcher {
    fn is_healthy(&self, _ip: &str) -> bool {
        true
    }

    fn untrack(&self, _ip: &str) {}
}

/// Probes a single instance's health endpoint.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Whether the instance at `ip` reports itself running.
    async fn status(&self, ip: &str) -> Result<bool, DnsError>;
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    state: String,
}

/// Checker hitting `https://<ip>:<port>/health` with the supplied client.
pub struct HttpHealthChecker {
    client: reqwest::Client,
    port: u16,
}

impl HttpHealthChecker {
    /// Create a checker from a pre-built (mTLS-configured) client.
    pub fn new(client: reqwest::Client, port: u16) -> Self {
        Self { client, port }
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn status(&self, ip: &str) -> Result<bool, DnsError> {
        let url = format!("https://{}:{}/health", ip, self.port);
        let response: HealthResponse = self.client.get(&url).send().await?.json().await?;
        Ok(response.state == "running")
    }
}

/// Build the mTLS HTTP client the health endpoint expects.
pub fn client_from_files(
    ca_file: Option<&Path>,
    certificate_file: Option<&Path>,
    private_key_file: Option<&Path>,
) -> Result<reqwest::Client, DnsError> {
    let mut builder = reqwest::Client::builder().timeout(PROBE_TIMEOUT);

    if let Some(ca) = ca_file {
        let pem = std::fs::read(ca)?;
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }

    if let (Some(cert), Some(key)) = (certificate_file, private_key_file) {
        let mut pem = std::fs::read(cert)?;
        pem.extend(std::fs::read(key)?);
        builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
    }

    Ok(builder.build()?)
}

/// Watcher that polls tracked IPs on an interval.
///
/// Unknown IPs are admitted as healthy and queued for an immediate probe;
/// the first observation then corrects the map.
pub struct ProbingHealthWatcher {
    checker: Arc<dyn HealthChecker>,
    interval: Duration,
    state: Mutex<HashMap<String, bool>>,
    probe_tx: mpsc::UnboundedSender<String>,
    probe_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl ProbingHealthWatcher {
    /// Create a watcher probing through `checker` every `interval`.
    pub fn new(checker: Arc<dyn HealthChecker>, interval: Duration) -> Self {
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();
        Self {
            checker,
            interval,
            state: Mutex::new(HashMap::new()),
            probe_tx,
            probe_rx: Mutex::new(Some(probe_rx)),
        }
    }

    /// Probe loop; runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let Some(mut probe_rx) = self.probe_rx.lock().take() else {
            return;
        };
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    debug!("health watcher shutting down");
                    return;
                }
                Some(ip) = probe_rx.recv() => {
                    self.probe(&ip).await;
                }
                _ = ticker.tick() => {
                    let tracked: Vec<String> = self.state.lock().keys().cloned().collect();
                    for ip in tracked {
                        self.probe(&ip).await;
                    }
                }
            }
        }
    }

    async fn probe(&self, ip: &str) {
        let healthy = match self.checker.status(ip).await {
            Ok(healthy) => healthy,
            Err(e) => {
                debug!(ip, error = %e, "health probe failed");
                false
            }
        };
        metrics::record_health_probe(healthy);

        let mut state = self.state.lock();
        // Skip if untracked while the probe was in flight.
        if let Some(entry) = state.get_mut(ip) {
            if *entry != healthy {
                warn!(ip, healthy, "instance health changed");
            }
            *entry = healthy;
        }
    }
}

impl HealthWatcher for ProbingHealthWatcher {
    fn is_healthy(&self, ip: &str) -> bool {
        let mut state = self.state.lock();
        if let Some(&healthy) = state.get(ip) {
            return healthy;
        }
        state.insert(ip.to_string(), true);
        let _ = self.probe_tx.send(ip.to_string());
        true
    }

    fn untrack(&self, ip: &str) {
        self.state.lock().remove(ip);
    }
}
