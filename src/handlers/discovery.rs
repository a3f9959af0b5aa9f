//! Discovery handler: answers A/ANY queries for local instance domains out
//! of the record set.

use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{Record, RecordType};
use tracing::{debug, warn};

use crate::error::DnsError;
use crate::metrics::{self, RequestResult, Timer};
use crate::records::RecordSet;
use crate::shuffle::Shuffler;

use super::{a_records, reply_to, trim_to_size, write_response, Handler, ResponseWriter};

/// Authoritative handler for the record set's domains.
pub struct DiscoveryHandler {
    record_set: Arc<RecordSet>,
    shuffler: Arc<dyn Shuffler<Record>>,
    recursion_available: bool,
}

impl DiscoveryHandler {
    /// Create a discovery handler over `record_set`.
    pub fn new(
        record_set: Arc<RecordSet>,
        shuffler: Arc<dyn Shuffler<Record>>,
        recursion_available: bool,
    ) -> Self {
        Self {
            record_set,
            shuffler,
            recursion_available,
        }
    }
}

#[async_trait]
impl Handler for DiscoveryHandler {
    async fn serve(&self, writer: &mut dyn ResponseWriter, request: &Message) {
        let timer = Timer::start();
        let mut response = reply_to(request);
        response.set_authoritative(true);
        response.set_recursion_available(self.recursion_available);

        let mut result = RequestResult::Empty;

        if let Some(query) = request.queries().first() {
            if matches!(query.query_type(), RecordType::A | RecordType::ANY) {
                let name = query.name().to_string();
                match self.record_set.resolve(&name) {
                    Ok(ips) => {
                        let mut answers = a_records(query.name(), &ips);
                        self.shuffler.shuffle(&mut answers);
                        for answer in answers {
                            response.add_answer(answer);
                        }
                        if response.answers().is_empty() {
                            debug!(name = %name, "local name resolved to no instances");
                        } else {
                            result = RequestResult::Success;
                        }
                    }
                    Err(e @ (DnsError::MalformedQuery(_) | DnsError::AmbiguousQuery)) => {
                        warn!(name = %name, error = %e, "rejecting malformed local query");
                        response.set_response_code(ResponseCode::NXDomain);
                        result = RequestResult::Failure;
                    }
                    Err(e) => {
                        warn!(name = %name, error = %e, "local resolution failed");
                        response.set_response_code(ResponseCode::ServFail);
                        result = RequestResult::Failure;
                    }
                }
            }
        }

        if let Err(e) = trim_to_size(&mut response, writer.udp_size_limit()) {
            warn!(error = %e, "could not size local response");
        }
        write_response(writer, &response).await;
        metrics::record_request("discovery", result, timer.elapsed());
    }
}
