//! Caching wrapper around any inner handler.
//!
//! Successful answers are cached against their question for the answer's
//! minimum TTL, bounded by an LRU. Hits are replayed with the request's id.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{DNSClass, RecordType};
use lru::LruCache;
use parking_lot::Mutex;

use crate::metrics;

use super::{write_response, CapturingWriter, Handler, ResponseWriter};

const CACHE_CAPACITY: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    name: String,
    query_type: RecordType,
    query_class: DNSClass,
}

struct CachedEntry {
    response: Message,
    expires_at: Instant,
}

/// TTL-respecting response cache wrapping an inner handler.
pub struct CachingHandler {
    inner: Arc<dyn Handler>,
    cache: Mutex<LruCache<CacheKey, CachedEntry>>,
}

impl CachingHandler {
    /// Wrap `inner` with a response cache.
    pub fn new(inner: Arc<dyn Handler>) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    fn cached(&self, key: &CacheKey, now: Instant) -> Option<Message> {
        let mut cache = self.cache.lock();
        let expired = match cache.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.response.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(key);
        }
        None
    }

    fn store(&self, key: CacheKey, response: &Message, now: Instant) {
        if response.response_code() != ResponseCode::NoError
            || response.truncated()
            || response.answers().is_empty()
        {
            return;
        }

        let min_ttl = response
            .answers()
            .iter()
            .map(|r| r.ttl())
            .min()
            .unwrap_or(0);
        if min_ttl == 0 {
            return;
        }

        self.cache.lock().put(
            key,
            CachedEntry {
                response: response.clone(),
                expires_at: now + Duration::from_secs(u64::from(min_ttl)),
            },
        );
    }
}

#[async_trait]
impl Handler for CachingHandler {
    async fn serve(&self, writer: &mut dyn ResponseWriter, request: &Message) {
        let Some(query) = request.queries().first() else {
            self.inner.serve(writer, request).await;
            return;
        };

        let key = CacheKey {
            name: query.name().to_string().to_ascii_lowercase(),
            query_type: query.query_type(),
            query_class: query.query_class(),
        };
        let now = Instant::now();

        if let Some(mut cached) = self.cached(&key, now) {
            metrics::record_cache_lookup(true);
            cached.set_id(request.id());
            write_response(writer, &cached).await;
            return;
        }
        metrics::record_cache_lookup(false);

        let mut capture = CapturingWriter::mirroring(writer);
        self.inner.serve(&mut capture, request).await;

        let Some(response) = capture.response else {
            return;
        };
        self.store(key, &response, now);
        write_response(writer, &response).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};
    use hickory_proto::xfer::Protocol;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticHandler {
        hits: AtomicUsize,
        ttl: u32,
    }

    #[async_trait]
    impl Handler for StaticHandler {
        async fn serve(&self, writer: &mut dyn ResponseWriter, request: &Message) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            let mut response = super::super::reply_to(request);
            let name = request.queries()[0].name().clone();
            let addr: std::net::Ipv4Addr = "10.1.2.3".parse().unwrap();
            let mut record = Record::from_rdata(name, self.ttl, RData::A(A::from(addr)));
            record.set_dns_class(DNSClass::IN);
            response.add_answer(record);
            write_response(writer, &response).await;
        }
    }

    fn request(id: u16, name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
        msg
    }

    fn writer() -> CapturingWriter {
        CapturingWriter::new("127.0.0.1:1234".parse().unwrap(), Protocol::Udp, Some(512))
    }

    #[tokio::test]
    async fn test_replays_cached_response_with_request_id() {
        let inner = Arc::new(StaticHandler {
            hits: AtomicUsize::new(0),
            ttl: 300,
        });
        let handler = CachingHandler::new(inner.clone());

        let mut w1 = writer();
        handler.serve(&mut w1, &request(1, "app.internal.")).await;
        let mut w2 = writer();
        handler.serve(&mut w2, &request(2, "app.internal.")).await;

        assert_eq!(inner.hits.load(Ordering::SeqCst), 1);
        assert_eq!(w2.response.unwrap().id(), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_answers_are_not_cached() {
        let inner = Arc::new(StaticHandler {
            hits: AtomicUsize::new(0),
            ttl: 0,
        });
        let handler = CachingHandler::new(inner.clone());

        let mut w1 = writer();
        handler.serve(&mut w1, &request(1, "app.internal.")).await;
        let mut w2 = writer();
        handler.serve(&mut w2, &request(2, "app.internal.")).await;

        assert_eq!(inner.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_distinct_questions_do_not_collide() {
        let inner = Arc::new(StaticHandler {
            hits: AtomicUsize::new(0),
            ttl: 300,
        });
        let handler = CachingHandler::new(inner.clone());

        let mut w1 = writer();
        handler.serve(&mut w1, &request(1, "a.internal.")).await;
        let mut w2 = writer();
        handler.serve(&mut w2, &request(2, "b.internal.")).await;

        assert_eq!(inner.hits.load(Ordering::SeqCst), 2);
    }
}
