//! Upstream recursor pool with pluggable attempt ordering.
//!
//! Callers never see the recursor list; they hand the pool an attempt
//! closure and the pool dictates ordering. The failover pool shuffles once
//! at construction, then rotates its starting point to the last recursor
//! that answered.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::error::DnsError;
use crate::metrics;
use crate::shuffle::Shuffler;

/// Drives attempts against upstream recursors in a strategy-defined order.
pub trait RecursorPool: Send + Sync {
    /// Invoke `attempt` per recursor until one succeeds. The first success
    /// stops iteration; exhaustion yields the final error.
    fn perform_strategically<T, F, Fut>(
        &self,
        attempt: F,
    ) -> impl Future<Output = Result<T, DnsError>> + Send
    where
        T: Send,
        F: FnMut(SocketAddr) -> Fut + Send,
        Fut: Future<Output = Result<T, DnsError>> + Send;
}

/// Shuffled-then-sticky ordering: the list is shuffled once and frozen;
/// later calls start from the last recursor that succeeded.
pub struct FailoverRecursorPool {
    recursors: Vec<SocketAddr>,
    preferred: AtomicUsize,
}

impl FailoverRecursorPool {
    /// Build a pool over `recursors`, ordered once by `shuffler`.
    pub fn new(mut recursors: Vec<SocketAddr>, shuffler: &dyn Shuffler<SocketAddr>) -> Self {
        shuffler.shuffle(&mut recursors);
        Self {
            recursors,
            preferred: AtomicUsize::new(0),
        }
    }

    /// Whether any recursors are configured.
    pub fn is_empty(&self) -> bool {
        self.recursors.is_empty()
    }
}

impl RecursorPool for FailoverRecursorPool {
    fn perform_strategically<T, F, Fut>(
        &self,
        mut attempt: F,
    ) -> impl Future<Output = Result<T, DnsError>> + Send
    where
        T: Send,
        F: FnMut(SocketAddr) -> Fut + Send,
        Fut: Future<Output = Result<T, DnsError>> + Send,
    {
        async move {
            if self.recursors.is_empty() {
                return Err(DnsError::NoRecursors);
            }

            let count = self.recursors.len();
            let start = self.preferred.load(Ordering::Relaxed) % count;
            let mut last_error = DnsError::NoRecursors;

            for offset in 0..count {
                let index = (start + offset) % count;
                let recursor = self.recursors[index];

                match attempt(recursor).await {
                    Ok(value) => {
                        metrics::record_recursor_attempt(true);
                        self.preferred.store(index, Ordering::Relaxed);
                        return Ok(value);
                    }
                    Err(e) => {
                        metrics::record_recursor_attempt(false);
                        debug!(recursor = %recursor, error = %e, "recursor attempt failed");
                        last_error = e;
                    }
                }
            }

            Err(last_error)
        }
    }
}

/// Parse configured recursor strings, defaulting the port to 53.
pub fn parse_recursor_addresses(recursors: &[String]) -> Result<Vec<SocketAddr>, DnsError> {
    recursors
        .iter()
        .map(|r| {
            if let Ok(addr) = r.parse::<SocketAddr>() {
                return Ok(addr);
            }
            if let Ok(ip) = r.parse::<std::net::IpAddr>() {
                return Ok(SocketAddr::new(ip, 53));
            }
            Err(DnsError::InvalidAddress(r.clone()))
        })
        .collect()
}

/// Discover recursors from the host's resolver configuration.
pub fn system_recursors() -> Result<Vec<SocketAddr>, DnsError> {
    let (config, _opts) = hickory_resolver::system_conf::read_system_conf()
        .map_err(|e| DnsError::Config(format!("reading system resolver config: {e}")))?;

    let mut seen = std::collections::HashSet::new();
    let recursors = config
        .name_servers()
        .iter()
        .map(|ns| ns.socket_addr)
        .filter(|addr| seen.insert(*addr))
        .collect();

    Ok(recursors)
}
