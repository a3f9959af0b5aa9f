//! Shared test infrastructure for the integration suites.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::xfer::Protocol;
use parking_lot::Mutex;

use fleet_dns::aliases::AliasConfig;
use fleet_dns::error::DnsError;
use fleet_dns::exchanger::{ExchangeAnswer, Exchanger};
use fleet_dns::handlers::{reply_to, ResponseWriter};
use fleet_dns::health::HealthWatcher;
use fleet_dns::records::RecordSet;
use fleet_dns::records_file::RecordFileReader;

// --- Records file fixtures ---

/// One row for the standard column layout used by [`records_json`].
pub struct RecordRow {
    pub id: &'static str,
    pub num_id: &'static str,
    pub group: &'static str,
    pub group_ids: &'static [&'static str],
    pub network: &'static str,
    pub deployment: &'static str,
    pub az_id: &'static str,
    pub ip: &'static str,
    pub domain: &'static str,
}

impl Default for RecordRow {
    fn default() -> Self {
        Self {
            id: "uuid-0",
            num_id: "0",
            group: "web",
            group_ids: &["7"],
            network: "default",
            deployment: "prod",
            az_id: "1",
            ip: "10.0.0.1",
            domain: "bosh",
        }
    }
}

/// Columnar records JSON for the given rows.
pub fn records_json(rows: &[RecordRow]) -> String {
    let infos: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| {
            serde_json::json!([
                r.id, r.num_id, r.group, r.group_ids, r.network, "1", r.deployment, r.az_id, 0,
                r.ip, r.domain
            ])
        })
        .collect();

    serde_json::json!({
        "record_keys": ["id", "num_id", "instance_group", "group_ids", "network", "network_id",
                        "deployment", "az_id", "instance_index", "ip", "domain"],
        "record_infos": infos
    })
    .to_string()
}

/// A records file on disk plus a fast-polling reader for it.
pub struct RecordsFixture {
    pub dir: tempfile::TempDir,
    pub path: PathBuf,
    pub reader: Arc<RecordFileReader>,
}

impl RecordsFixture {
    pub fn new(contents: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, contents).unwrap();
        let reader = Arc::new(RecordFileReader::with_poll_interval(
            path.clone(),
            Duration::from_millis(50),
        ));
        Self { dir, path, reader }
    }

    /// Overwrite the records file, forcing a fresh modification time.
    pub fn rewrite(&self, contents: &str) {
        std::fs::write(&self.path, contents).unwrap();
        let file = std::fs::File::options()
            .write(true)
            .open(&self.path)
            .unwrap();
        file.set_modified(std::time::SystemTime::now() + Duration::from_secs(5))
            .unwrap();
    }
}

/// Build a record set over a fixture with the given collaborators.
pub async fn build_record_set(
    fixture: &RecordsFixture,
    aliases: AliasConfig,
    watcher: Arc<dyn HealthWatcher>,
    max_tracked: usize,
) -> Arc<RecordSet> {
    RecordSet::new(fixture.reader.clone(), aliases, watcher, max_tracked).await
}

// --- Health watcher fake ---

/// Watcher with scripted healthiness and a log of untracked IPs.
#[derive(Default)]
pub struct FakeHealthWatcher {
    healthy: Mutex<HashSet<String>>,
    unhealthy: Mutex<HashSet<String>>,
    untracked: Mutex<Vec<String>>,
}

impl FakeHealthWatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark an IP healthy.
    pub fn set_healthy(&self, ip: &str) {
        self.unhealthy.lock().remove(ip);
        self.healthy.lock().insert(ip.to_string());
    }

    /// Mark an IP unhealthy.
    pub fn set_unhealthy(&self, ip: &str) {
        self.healthy.lock().remove(ip);
        self.unhealthy.lock().insert(ip.to_string());
    }

    /// IPs untracked so far, in order.
    pub fn untracked(&self) -> Vec<String> {
        self.untracked.lock().clone()
    }
}

impl HealthWatcher for FakeHealthWatcher {
    fn is_healthy(&self, ip: &str) -> bool {
        !self.unhealthy.lock().contains(ip)
    }

    fn untrack(&self, ip: &str) {
        self.untracked.lock().push(ip.to_string());
    }
}

// --- Query / writer helpers ---

/// Build a query message.
pub fn build_query(name: &str, record_type: RecordType, id: u16) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_ascii(name).unwrap(), record_type));
    msg
}

/// Writer that records every response written.
pub struct TestWriter {
    remote: SocketAddr,
    protocol: Protocol,
    limit: Option<u16>,
    pub written: Vec<Message>,
}

impl TestWriter {
    pub fn udp() -> Self {
        Self {
            remote: "127.0.0.1:5454".parse().unwrap(),
            protocol: Protocol::Udp,
            limit: Some(512),
            written: Vec::new(),
        }
    }

    pub fn tcp() -> Self {
        Self {
            remote: "127.0.0.1:5454".parse().unwrap(),
            protocol: Protocol::Tcp,
            limit: None,
            written: Vec::new(),
        }
    }

    /// The single response this writer must have seen.
    pub fn sole_response(&self) -> &Message {
        assert_eq!(self.written.len(), 1, "expected exactly one response");
        &self.written[0]
    }
}

#[async_trait]
impl ResponseWriter for TestWriter {
    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn udp_size_limit(&self) -> Option<u16> {
        self.limit
    }

    async fn write_msg(&mut self, response: &Message) -> Result<(), DnsError> {
        self.written.push(response.clone());
        Ok(())
    }
}

/// Extract A record addresses, in answer order.
pub fn extract_a_ips(msg: &Message) -> Vec<String> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(std::net::Ipv4Addr::from(*a).to_string()),
            _ => None,
        })
        .collect()
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}

// --- Mock exchanger ---

/// Scripted outcome for one recursor.
pub enum MockOutcome {
    /// Answer with the given A record addresses.
    Answer(Vec<&'static str>),
    /// Truncated answer with the given A record addresses.
    Truncated(Vec<&'static str>),
    /// The exchange fails.
    Fail,
}

/// Exchanger with per-recursor scripted outcomes and a call log.
pub struct MockExchanger {
    outcomes: HashMap<SocketAddr, MockOutcome>,
    pub calls: Mutex<Vec<SocketAddr>>,
}

impl MockExchanger {
    pub fn new(outcomes: Vec<(&str, MockOutcome)>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: outcomes
                .into_iter()
                .map(|(addr, outcome)| (addr.parse().unwrap(), outcome))
                .collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<SocketAddr> {
        self.calls.lock().clone()
    }

    fn answer(&self, request: &Message, ips: &[&str], truncated: bool) -> ExchangeAnswer {
        let mut message = reply_to(request);
        let name = request.queries()[0].name().clone();
        for ip in ips {
            let addr: std::net::Ipv4Addr = ip.parse().unwrap();
            let mut record = Record::from_rdata(name.clone(), 300, RData::A(A::from(addr)));
            record.set_dns_class(DNSClass::IN);
            message.add_answer(record);
        }
        message.set_truncated(truncated);
        ExchangeAnswer { message, truncated }
    }
}

#[async_trait]
impl Exchanger for MockExchanger {
    async fn exchange(
        &self,
        request: &Message,
        recursor: SocketAddr,
    ) -> Result<ExchangeAnswer, DnsError> {
        self.calls.lock().push(recursor);
        match self.outcomes.get(&recursor) {
            Some(MockOutcome::Answer(ips)) => Ok(self.answer(request, ips, false)),
            Some(MockOutcome::Truncated(ips)) => Ok(self.answer(request, ips, true)),
            Some(MockOutcome::Fail) | None => {
                Err(DnsError::Exchange(format!("{recursor} unreachable")))
            }
        }
    }
}
