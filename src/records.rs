//! Instance records: columnar ingestion and health-filtered resolution.
//!
//! The record file is columnar JSON (`record_keys` naming the columns,
//! `record_infos` carrying one row per instance). Column order is dynamic.
//! The record set keeps the parsed rows plus the distinct top-level domains
//! behind one readers-writer lock, so every query resolves against a single
//! generation of the file.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::aliases::AliasConfig;
use crate::criteria::{self, Criteria};
use crate::error::DnsError;
use crate::health::{HealthStrategy, HealthWatcher};
use crate::metrics;
use crate::records_file::RecordFileReader;
use crate::shutdown::ShutdownSignal;
use crate::tracker::DomainTracker;

/// Normalize a name: lowercase, trailing dot.
pub fn fqdn(name: &str) -> String {
    let mut name = name.to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

/// One instance record from the record file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// Instance id.
    pub id: String,
    /// Numeric instance id, as its decimal string.
    pub num_id: String,
    /// Instance group name.
    pub instance_group: String,
    /// Group ids the instance belongs to.
    pub group_ids: Vec<String>,
    /// Network name.
    pub network: String,
    /// Numeric network id, as its decimal string.
    pub network_id: String,
    /// Deployment name.
    pub deployment: String,
    /// Availability-zone id.
    pub az_id: String,
    /// Index of the instance within its group, as its decimal string.
    pub instance_index: String,
    /// IPv4 address, textual.
    pub ip: String,
    /// Top-level domain the record lives under, trailing-dot normalized.
    pub domain: String,
}

#[derive(Debug, Deserialize)]
struct RecordFile {
    record_keys: Vec<String>,
    record_infos: Vec<Vec<serde_json::Value>>,
}

#[derive(Default)]
struct Columns {
    id: Option<usize>,
    num_id: Option<usize>,
    instance_group: Option<usize>,
    group_ids: Option<usize>,
    network: Option<usize>,
    network_id: Option<usize>,
    deployment: Option<usize>,
    az_id: Option<usize>,
    instance_index: Option<usize>,
    ip: Option<usize>,
    domain: Option<usize>,
}

impl Columns {
    fn discover(keys: &[String]) -> Self {
        let mut columns = Self::default();
        for (i, key) in keys.iter().enumerate() {
            match key.as_str() {
                "id" => columns.id = Some(i),
                "num_id" => columns.num_id = Some(i),
                "instance_group" => columns.instance_group = Some(i),
                "group_ids" => columns.group_ids = Some(i),
                "network" => columns.network = Some(i),
                "network_id" => columns.network_id = Some(i),
                "deployment" => columns.deployment = Some(i),
                "az_id" => columns.az_id = Some(i),
                "instance_index" => columns.instance_index = Some(i),
                "ip" => columns.ip = Some(i),
                "domain" => columns.domain = Some(i),
                _ => {}
            }
        }
        columns
    }
}

/// Parse the columnar records JSON. Malformed rows are skipped with a
/// warning; a malformed document is an error.
pub fn parse_records(contents: &[u8]) -> Result<Vec<Record>, DnsError> {
    let file: RecordFile = serde_json::from_slice(contents)?;
    let columns = Columns::discover(&file.record_keys);
    let key_count = file.record_keys.len();

    let mut records = Vec::with_capacity(file.record_infos.len());

    'rows: for (row_index, row) in file.record_infos.iter().enumerate() {
        if row.len() != key_count {
            warn!(
                row = row_index,
                found = row.len(),
                expected = key_count,
                "unbalanced records row"
            );
            continue;
        }

        let mut record = Record::default();

        for (field, column, name) in [
            (&mut record.id, columns.id, "id"),
            (&mut record.instance_group, columns.instance_group, "instance_group"),
            (&mut record.network, columns.network, "network"),
            (&mut record.deployment, columns.deployment, "deployment"),
            (&mut record.ip, columns.ip, "ip"),
            (&mut record.domain, columns.domain, "domain"),
        ] {
            match required_string(row, column) {
                Some(value) => *field = value,
                None => {
                    warn!(row = row_index, field = name, "missing or mistyped required value");
                    continue 'rows;
                }
            }
        }

        for (field, column, name) in [
            (&mut record.num_id, columns.num_id, "num_id"),
            (&mut record.network_id, columns.network_id, "network_id"),
            (&mut record.az_id, columns.az_id, "az_id"),
        ] {
            match optional_string(row, column) {
                Some(value) => *field = value,
                None => {
                    warn!(row = row_index, field = name, "mistyped optional value");
                    continue 'rows;
                }
            }
        }

        if let Some(index) = columns.group_ids {
            match string_array(&row[index]) {
                Some(values) => record.group_ids = values,
                None => {
                    warn!(row = row_index, field = "group_ids", "expected an array of strings");
                    continue 'rows;
                }
            }
        }

        if let Some(index) = columns.instance_index {
            match row[index].as_f64() {
                Some(value) => record.instance_index = (value as i64).to_string(),
                None => warn!(row = row_index, field = "instance_index", "expected a number"),
            }
        }

        record.domain = fqdn(&record.domain);
        records.push(record);
    }

    Ok(records)
}

fn required_string(row: &[serde_json::Value], column: Option<usize>) -> Option<String> {
    row.get(column?)?.as_str().map(str::to_string)
}

fn optional_string(row: &[serde_json::Value], column: Option<usize>) -> Option<String> {
    let Some(index) = column else {
        return Some(String::new());
    };
    match &row[index] {
        serde_json::Value::Null => Some(String::new()),
        serde_json::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn string_array(value: &serde_json::Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

struct Store {
    records: Vec<Record>,
    domains: Vec<String>,
}

/// The in-memory record index with alias expansion, bounded query tracking,
/// and health filtering.
pub struct RecordSet {
    reader: Arc<RecordFileReader>,
    aliases: AliasConfig,
    health: Arc<dyn HealthWatcher>,
    store: RwLock<Store>,
    tracker: Mutex<DomainTracker>,
    subscribers: Mutex<Vec<mpsc::Sender<bool>>>,
}

impl RecordSet {
    /// Build a record set and perform the initial read of the record file.
    pub async fn new(
        reader: Arc<RecordFileReader>,
        aliases: AliasConfig,
        health: Arc<dyn HealthWatcher>,
        max_tracked_domains: usize,
    ) -> Arc<Self> {
        let set = Arc::new(Self {
            reader,
            aliases,
            health,
            store: RwLock::new(Store {
                records: Vec::new(),
                domains: Vec::new(),
            }),
            tracker: Mutex::new(DomainTracker::new(max_tracked_domains)),
            subscribers: Mutex::new(Vec::new()),
        });
        set.update().await;
        set
    }

    /// Follow record-file change notifications until shutdown or the
    /// notification stream ends; either way, subscriber channels close.
    pub fn start(self: &Arc<Self>, shutdown: ShutdownSignal) -> tokio::task::JoinHandle<()> {
        let set = self.clone();
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let mut notifications = set.reader.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    changed = notifications.recv() => match changed {
                        Some(_) => {
                            set.update().await;
                            set.refresh_tracked_ips();
                            set.broadcast();
                        }
                        None => break,
                    }
                }
            }
            set.subscribers.lock().clear();
        })
    }

    /// Subscribe to record-set update notifications.
    pub fn subscribe(&self) -> mpsc::Receiver<bool> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.lock().push(tx);
        rx
    }

    /// The top-level domains currently served locally: every domain seen in
    /// the record file plus every alias host.
    pub fn domains(&self) -> Vec<String> {
        let mut domains = self.store.read().domains.clone();
        domains.extend(self.aliases.alias_hosts());
        domains
    }

    /// Resolve a name into its health-filtered IP list.
    ///
    /// The name is recorded in the tracked-domain transcript first; an
    /// eviction caused by the touch unsubscribes any IP left without a
    /// referencing domain.
    pub fn resolve(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let name = fqdn(name);
        let store = self.store.read();

        {
            let mut tracker = self.tracker.lock();
            if let Some(evicted) = tracker.touch(&name) {
                debug!(domain = %evicted, "evicted from tracked-domain transcript");
                metrics::record_eviction();
                for ip in tracker.remove_domain(&evicted) {
                    self.health.untrack(&ip);
                }
            }
        }

        let resolutions = self.aliases.resolutions(&name);
        if resolutions.is_empty() {
            if let Ok(ip) = name.trim_end_matches('.').parse::<IpAddr>() {
                return Ok(vec![ip.to_string()]);
            }
            let (ips, criteria) = self.resolve_query(&store, &name)?;
            let (healthy, unhealthy) = self.segregate(ips, &name);
            let strategy = HealthStrategy::from_code(criteria.strategy_code());
            return Ok(strategy.filter(healthy, unhealthy));
        }

        let mut final_ips = Vec::new();
        let mut errors = Vec::new();
        for target in resolutions {
            if target.parse::<IpAddr>().is_ok() {
                final_ips.push(target);
                continue;
            }

            let (ips, criteria) = match self.resolve_query(&store, &target) {
                Ok(resolved) => resolved,
                Err(e) => {
                    errors.push(e.to_string());
                    continue;
                }
            };
            let (healthy, unhealthy) = self.segregate(ips, &name);
            let strategy = HealthStrategy::from_code(criteria.strategy_code());
            final_ips.extend(strategy.filter(healthy, unhealthy));
        }

        if final_ips.is_empty() && !errors.is_empty() {
            return Err(DnsError::AliasResolution(errors.join("; ")));
        }
        Ok(final_ips)
    }

    fn resolve_query(&self, store: &Store, name: &str) -> Result<(Vec<String>, Criteria), DnsError> {
        let Some(criteria) = criteria::parse_query(name, &store.domains)? else {
            return Ok((Vec::new(), Criteria::default()));
        };

        let ips = store
            .records
            .iter()
            .filter(|record| criteria.matches(record))
            .map(|record| record.ip.clone())
            .collect();

        Ok((ips, criteria))
    }

    /// Track each IP under the queried name and split by healthiness.
    /// Asking the watcher subscribes it to IPs it has not seen.
    fn segregate(&self, ips: Vec<String>, name: &str) -> (Vec<String>, Vec<String>) {
        let mut tracker = self.tracker.lock();
        let mut healthy = Vec::new();
        let mut unhealthy = Vec::new();

        for ip in ips {
            tracker.track(&ip, name);
            if self.health.is_healthy(&ip) {
                healthy.push(ip);
            } else {
                unhealthy.push(ip);
            }
        }

        (healthy, unhealthy)
    }

    /// Replace the current snapshot with a fresh parse of the record file.
    /// Read or parse failures keep the current snapshot.
    async fn update(&self) {
        let contents = match self.reader.get().await {
            Ok(contents) => contents,
            Err(e) => {
                warn!(error = %e, "could not read records file; keeping current snapshot");
                return;
            }
        };
        let records = match parse_records(&contents) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "could not parse records file; keeping current snapshot");
                return;
            }
        };

        let mut domains = Vec::new();
        let mut seen = HashSet::new();
        for record in &records {
            if seen.insert(record.domain.clone()) {
                domains.push(record.domain.clone());
            }
        }

        metrics::record_records_reload(records.len(), domains.len());
        debug!(records = records.len(), domains = domains.len(), "records updated");

        let mut store = self.store.write();
        store.records = records;
        store.domains = domains;
    }

    /// Rebuild the tracked-IP index from the domains still in the
    /// transcript, subscribing the watcher to new IPs and unsubscribing the
    /// ones no longer reachable.
    fn refresh_tracked_ips(&self) {
        let store = self.store.read();
        let mut tracker = self.tracker.lock();

        let mut new_index: HashMap<String, HashSet<String>> = HashMap::new();
        for domain in tracker.registry() {
            let ips = match self.local_ips(&store, &domain) {
                Ok(ips) => ips,
                Err(_) => continue,
            };
            for ip in ips {
                new_index.entry(ip).or_default().insert(domain.clone());
            }
        }

        let (newly_tracked, untracked) = tracker.replace_index(new_index);
        for ip in newly_tracked {
            self.health.is_healthy(&ip);
        }
        for ip in untracked {
            self.health.untrack(&ip);
        }

        metrics::record_tracking(tracker.domain_count(), tracker.ip_count());
    }

    /// Alias-aware local resolution without touching the transcript or the
    /// health filter. Feeds the tracked-IP rebuild.
    fn local_ips(&self, store: &Store, name: &str) -> Result<Vec<String>, DnsError> {
        let name = fqdn(name);
        let resolutions = self.aliases.resolutions(&name);
        if resolutions.is_empty() {
            return Ok(self.resolve_query(store, &name)?.0);
        }

        let mut ips = Vec::new();
        for target in resolutions {
            if target.parse::<IpAddr>().is_ok() {
                ips.push(target);
            } else if let Ok((target_ips, _)) = self.resolve_query(store, &target) {
                ips.extend(target_ips);
            }
        }
        Ok(ips)
    }

    fn broadcast(&self) {
        let subscribers = self.subscribers.lock();
        for subscriber in subscribers.iter() {
            if subscriber.try_send(true).is_err() {
                warn!("subscriber not draining; dropped record-set notification");
            }
        }
    }
}
