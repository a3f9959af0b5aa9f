//! Catch-all handler forwarding questions to upstream recursors.

use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::xfer::Protocol;
use tracing::{debug, info, warn};

use crate::exchanger::Exchanger;
use crate::metrics::{self, RequestResult, Timer};
use crate::recursors::RecursorPool;

use super::{reply_to, servfail_reply, write_response, Handler, ResponseWriter};

/// Builds a per-request exchanger for the client's transport.
pub type ExchangerFactory = Arc<dyn Fn(Protocol) -> Arc<dyn Exchanger> + Send + Sync>;

/// Forwards every question to the recursor pool and relays the first answer.
pub struct ForwardHandler<P> {
    pool: Arc<P>,
    recursion_available: bool,
    exchanger_factory: ExchangerFactory,
}

impl<P> ForwardHandler<P> {
    /// Create a forward handler over `pool`.
    pub fn new(pool: Arc<P>, recursion_available: bool, exchanger_factory: ExchangerFactory) -> Self {
        Self {
            pool,
            recursion_available,
            exchanger_factory,
        }
    }
}

#[async_trait]
impl<P: RecursorPool + 'static> Handler for ForwardHandler<P> {
    async fn serve(&self, writer: &mut dyn ResponseWriter, request: &Message) {
        let timer = Timer::start();

        if request.queries().is_empty() {
            let mut response = reply_to(request);
            response.set_recursion_available(true);
            response.set_authoritative(true);
            info!(handler = "ForwardHandler", "received a request with no questions");
            write_response(writer, &response).await;
            metrics::record_request("forward", RequestResult::Empty, timer.elapsed());
            return;
        }

        if !self.recursion_available {
            let mut response = servfail_reply(request);
            response.set_recursion_available(false);
            write_response(writer, &response).await;
            warn!(handler = "ForwardHandler", "no recursors configured");
            metrics::record_request("forward", RequestResult::Failure, timer.elapsed());
            return;
        }

        let exchanger = (self.exchanger_factory)(writer.protocol());

        let result = self
            .pool
            .perform_strategically(|recursor| {
                let exchanger = exchanger.clone();
                let request = request.clone();
                async move {
                    exchanger
                        .exchange(&request, recursor)
                        .await
                        .map(|answer| (answer, recursor))
                }
            })
            .await;

        match result {
            Ok((answer, recursor)) => {
                let mut response = answer.message;
                response.set_recursion_available(true);
                write_response(writer, &response).await;
                debug!(
                    handler = "ForwardHandler",
                    recursor = %recursor,
                    rcode = ?response.response_code(),
                    truncated = answer.truncated,
                    duration_ns = timer.elapsed().as_nanos() as u64,
                    "forwarded request"
                );
                metrics::record_request("forward", RequestResult::Success, timer.elapsed());
            }
            Err(e) => {
                let mut response = servfail_reply(request);
                response.set_recursion_available(true);
                write_response(writer, &response).await;
                info!(handler = "ForwardHandler", error = %e, "all recursors failed");
                metrics::record_request("forward", RequestResult::Failure, timer.elapsed());
            }
        }
    }
}
