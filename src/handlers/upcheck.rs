//! Handler answering upcheck domains.
//!
//! Replies `A 127.0.0.1` TTL 0 for the queried name, the answer the
//! validating upchecks look for.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, RData, Record};

use crate::metrics::{self, RequestResult, Timer};

use super::{reply_to, write_response, Handler, ResponseWriter};

/// The address upchecks expect back.
pub const UPCHECK_ANSWER: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Answers self-query upchecks.
pub struct UpcheckHandler {
    recursion_available: bool,
}

impl UpcheckHandler {
    /// Create the handler.
    pub fn new(recursion_available: bool) -> Self {
        Self {
            recursion_available,
        }
    }
}

#[async_trait]
impl Handler for UpcheckHandler {
    async fn serve(&self, writer: &mut dyn ResponseWriter, request: &Message) {
        let timer = Timer::start();
        let mut response = reply_to(request);
        response.set_authoritative(true);
        response.set_recursion_available(self.recursion_available);

        if let Some(query) = request.queries().first() {
            let mut record =
                Record::from_rdata(query.name().clone(), 0, RData::A(A::from(UPCHECK_ANSWER)));
            record.set_dns_class(DNSClass::IN);
            response.add_answer(record);
        }

        write_response(writer, &response).await;
        metrics::record_request("upcheck", RequestResult::Success, timer.elapsed());
    }
}
