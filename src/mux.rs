//! Longest-suffix dispatch of questions to registered handlers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::criteria::is_domain_suffix;
use crate::handlers::{servfail_reply, write_response, Handler, ResponseWriter};
use crate::records::{fqdn, RecordSet};
use crate::shutdown::ShutdownSignal;

/// Routes questions to the handler registered at the longest matching
/// suffix; `.` is the catch-all.
#[derive(Default)]
pub struct Mux {
    routes: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl Mux {
    /// An empty mux. Questions matching no route get ServFail until a `.`
    /// handler is registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler at a domain suffix.
    pub fn handle(&self, suffix: &str, handler: Arc<dyn Handler>) {
        self.routes.write().insert(fqdn(suffix), handler);
    }

    /// Remove the handler registered at a suffix.
    pub fn deregister(&self, suffix: &str) {
        self.routes.write().remove(&fqdn(suffix));
    }

    /// The handler owning `name`: the longest registered suffix of it.
    fn lookup(&self, name: &str) -> Option<Arc<dyn Handler>> {
        let name = fqdn(name);
        let routes = self.routes.read();

        let mut best: Option<(&String, &Arc<dyn Handler>)> = None;
        for (suffix, handler) in routes.iter() {
            if is_domain_suffix(&name, suffix)
                && best.map(|(s, _)| suffix.len() > s.len()).unwrap_or(true)
            {
                best = Some((suffix, handler));
            }
        }

        best.map(|(_, handler)| handler.clone())
    }
}

#[async_trait]
impl Handler for Mux {
    async fn serve(&self, writer: &mut dyn ResponseWriter, request: &Message) {
        let handler = match request.queries().first() {
            Some(query) => self.lookup(&query.name().to_string()),
            // Question-less requests fall through to the catch-all.
            None => self.lookup("."),
        };

        match handler {
            Some(handler) => handler.serve(writer, request).await,
            None => {
                warn!("no handler registered for request");
                write_response(writer, &servfail_reply(request)).await;
            }
        }
    }
}

/// Keeps discovery-handler registrations in step with the record set's
/// domain list. Registration changes are serialized through this task.
pub struct HandlerRegistrar {
    mux: Arc<Mux>,
    record_set: Arc<RecordSet>,
    discovery: Arc<dyn Handler>,
    registered: Mutex<HashSet<String>>,
}

impl HandlerRegistrar {
    /// Create a registrar and register the record set's current domains.
    pub fn new(mux: Arc<Mux>, record_set: Arc<RecordSet>, discovery: Arc<dyn Handler>) -> Self {
        let registrar = Self {
            mux,
            record_set,
            discovery,
            registered: Mutex::new(HashSet::new()),
        };
        registrar.sync();
        registrar
    }

    /// Follow record-set updates until shutdown or the stream ends.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut notifications = self.record_set.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                changed = notifications.recv() => match changed {
                    Some(_) => self.sync(),
                    None => return,
                }
            }
        }
    }

    fn sync(&self) {
        let domains: HashSet<String> = self.record_set.domains().iter().map(|d| fqdn(d)).collect();
        let mut registered = self.registered.lock();

        for domain in domains.difference(&registered) {
            debug!(domain = %domain, "registering local domain");
            self.mux.handle(domain, self.discovery.clone());
        }
        for domain in registered.difference(&domains) {
            debug!(domain = %domain, "deregistering local domain");
            self.mux.deregister(domain);
        }

        *registered = domains;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        hits: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn serve(&self, _writer: &mut dyn ResponseWriter, _request: &Message) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn query_for(name: &str) -> Message {
        let mut msg = Message::new();
        msg.add_query(hickory_proto::op::Query::query(
            hickory_proto::rr::Name::from_ascii(name).unwrap(),
            hickory_proto::rr::RecordType::A,
        ));
        msg
    }

    fn test_writer() -> crate::handlers::CapturingWriter {
        crate::handlers::CapturingWriter::new(
            "127.0.0.1:5353".parse().unwrap(),
            hickory_proto::xfer::Protocol::Udp,
            Some(512),
        )
    }

    #[tokio::test]
    async fn test_longest_suffix_wins() {
        let mux = Mux::new();
        let short = CountingHandler::new();
        let long = CountingHandler::new();
        let root = CountingHandler::new();
        mux.handle("bosh.", short.clone());
        mux.handle("internal.bosh.", long.clone());
        mux.handle(".", root.clone());

        let mut writer = test_writer();
        mux.serve(&mut writer, &query_for("a.internal.bosh.")).await;

        assert_eq!(long.hits.load(Ordering::SeqCst), 1);
        assert_eq!(short.hits.load(Ordering::SeqCst), 0);
        assert_eq!(root.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_falls_through_to_catch_all() {
        let mux = Mux::new();
        let root = CountingHandler::new();
        mux.handle(".", root);
        assert!(mux.lookup("anything.example.com.").is_some());
    }

    #[test]
    fn test_no_match_without_catch_all() {
        let mux = Mux::new();
        mux.handle("bosh.", CountingHandler::new());
        assert!(mux.lookup("example.com.").is_none());
    }

    #[test]
    fn test_suffix_respects_label_boundaries() {
        let mux = Mux::new();
        mux.handle("bosh.", CountingHandler::new());
        assert!(mux.lookup("mybosh.").is_none());
        assert!(mux.lookup("a.bosh.").is_some());
        assert!(mux.lookup("bosh.").is_some());
    }

    #[test]
    fn test_deregister_removes_route() {
        let mux = Mux::new();
        mux.handle("bosh.", CountingHandler::new());
        assert!(mux.lookup("a.bosh.").is_some());
        mux.deregister("bosh.");
        assert!(mux.lookup("a.bosh.").is_none());
    }
}
