//! Metrics instrumentation for fleet-dns.
//!
//! All metrics are prefixed with `fleet_dns.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record a handled DNS request.
pub fn record_request(handler: &'static str, result: RequestResult, duration: std::time::Duration) {
    let result_str = match result {
        RequestResult::Success => "success",
        RequestResult::Empty => "empty",
        RequestResult::Failure => "failure",
    };

    counter!("fleet_dns.request.count", "handler" => handler, "result" => result_str).increment(1);
    histogram!("fleet_dns.request.duration.seconds", "handler" => handler)
        .record(duration.as_secs_f64());
}

/// Request outcome for metrics.
#[derive(Debug, Clone, Copy)]
pub enum RequestResult {
    /// The handler produced answers.
    Success,
    /// The handler produced a clean reply with no answers.
    Empty,
    /// The handler replied with a failure code.
    Failure,
}

/// Record one recursor exchange attempt.
pub fn record_recursor_attempt(ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    counter!("fleet_dns.recursor.attempt.count", "outcome" => outcome).increment(1);
}

/// Record a health probe outcome.
pub fn record_health_probe(healthy: bool) {
    let state = if healthy { "healthy" } else { "unhealthy" };
    counter!("fleet_dns.health.probe.count", "state" => state).increment(1);
}

/// Record current tracking sizes (domains in the transcript, subscribed IPs).
pub fn record_tracking(domains: usize, ips: usize) {
    gauge!("fleet_dns.tracking.domains").set(domains as f64);
    gauge!("fleet_dns.tracking.ips").set(ips as f64);
}

/// Record a tracked-domain eviction.
pub fn record_eviction() {
    counter!("fleet_dns.tracking.eviction.count").increment(1);
}

/// Record a record-file reload.
pub fn record_records_reload(records: usize, domains: usize) {
    counter!("fleet_dns.records.reload.count").increment(1);
    gauge!("fleet_dns.records.count").set(records as f64);
    gauge!("fleet_dns.records.domains").set(domains as f64);
}

/// Record a response-cache lookup.
pub fn record_cache_lookup(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!("fleet_dns.cache.lookup.count", "outcome" => outcome).increment(1);
}

/// Record a UDP response that had to be emitted with name compression.
pub fn record_compressed_response() {
    counter!("fleet_dns.response.compressed.count").increment(1);
}

/// Record an upcheck outcome.
pub fn record_upcheck(protocol: &'static str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    counter!("fleet_dns.upcheck.count", "protocol" => protocol, "outcome" => outcome).increment(1);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
