//! Handler for reverse-lookup (`arpa.`) queries.
//!
//! No PTR data is maintained for instance addresses, so reverse queries get
//! an empty authoritative answer rather than a referral upstream.

use async_trait::async_trait;
use hickory_proto::op::Message;
use tracing::debug;

use crate::metrics::{self, RequestResult, Timer};

use super::{reply_to, write_response, Handler, ResponseWriter};

/// Answers reverse-zone queries with an empty authoritative reply.
pub struct ArpaHandler {
    recursion_available: bool,
}

impl ArpaHandler {
    /// Create the handler.
    pub fn new(recursion_available: bool) -> Self {
        Self {
            recursion_available,
        }
    }
}

#[async_trait]
impl Handler for ArpaHandler {
    async fn serve(&self, writer: &mut dyn ResponseWriter, request: &Message) {
        let timer = Timer::start();
        if let Some(query) = request.queries().first() {
            debug!(name = %query.name(), "no reverse records maintained");
        }

        let mut response = reply_to(request);
        response.set_authoritative(true);
        response.set_recursion_available(self.recursion_available);
        write_response(writer, &response).await;
        metrics::record_request("arpa", RequestResult::Empty, timer.elapsed());
    }
}
