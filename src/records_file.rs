//! Record file reader: publishes file contents and change notifications.
//!
//! Change detection is modification-time polling. Subscribers get a boolean
//! signal per detected change over a bounded channel; a subscriber that is
//! not draining misses the signal (drop-and-log) rather than blocking the
//! reader. All subscriber channels close when the reader stops.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::DnsError;
use crate::shutdown::ShutdownSignal;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Watches the records file on disk.
pub struct RecordFileReader {
    path: PathBuf,
    poll_interval: Duration,
    subscribers: Mutex<Vec<mpsc::Sender<bool>>>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl RecordFileReader {
    /// Create a reader for `path` with the default poll interval.
    pub fn new(path: PathBuf) -> Self {
        Self::with_poll_interval(path, POLL_INTERVAL)
    }

    /// Create a reader polling at a custom interval.
    pub fn with_poll_interval(path: PathBuf, poll_interval: Duration) -> Self {
        Self {
            path,
            poll_interval,
            subscribers: Mutex::new(Vec::new()),
            last_modified: Mutex::new(None),
        }
    }

    /// Current file contents.
    pub async fn get(&self) -> Result<Vec<u8>, DnsError> {
        Ok(tokio::fs::read(&self.path).await?)
    }

    /// Subscribe to change notifications. The channel closes when the
    /// reader stops.
    pub fn subscribe(&self) -> mpsc::Receiver<bool> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Poll loop; runs until shutdown, then drops every subscriber channel.
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    debug!("record file reader shutting down");
                    self.subscribers.lock().clear();
                    return;
                }
                _ = ticker.tick() => {
                    if self.poll_once() {
                        self.broadcast();
                    }
                }
            }
        }
    }

    /// Check the file's modification time; true when it moved.
    fn poll_once(&self) -> bool {
        let modified = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "could not stat records file");
                return false;
            }
        };

        let mut last = self.last_modified.lock();
        match *last {
            Some(seen) if seen == modified => false,
            Some(_) => {
                *last = Some(modified);
                true
            }
            None => {
                // First observation establishes the baseline; the record set
                // already did its initial read.
                *last = Some(modified);
                false
            }
        }
    }

    fn broadcast(&self) {
        let subscribers = self.subscribers.lock();
        for subscriber in subscribers.iter() {
            if subscriber.try_send(true).is_err() {
                warn!("subscriber not draining; dropped records-file notification");
            }
        }
    }
}
