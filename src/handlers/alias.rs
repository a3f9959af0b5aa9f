//! Alias-resolving handler wrapping the mux.
//!
//! An alias with exactly one name target is answered by rewriting the
//! question to the target, recursing through the mux, and substituting the
//! requested name back into the reply. Aliases expanding to several targets
//! or to literal IPs are synthesized directly from the record set.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::{Name, Record};
use tracing::warn;

use crate::aliases::AliasConfig;
use crate::error::DnsError;
use crate::metrics::{self, RequestResult, Timer};
use crate::mux::Mux;
use crate::records::{fqdn, RecordSet};
use crate::shuffle::Shuffler;

use super::{
    a_records, reply_to, servfail_reply, trim_to_size, write_response, CapturingWriter, Handler,
    ResponseWriter,
};

/// Rewrites alias questions before dispatching to the mux.
pub struct AliasResolvingHandler {
    mux: Arc<Mux>,
    aliases: AliasConfig,
    record_set: Arc<RecordSet>,
    shuffler: Arc<dyn Shuffler<Record>>,
    recursion_available: bool,
}

impl AliasResolvingHandler {
    /// Create the handler, validating that every alias and name target is a
    /// usable DNS name.
    pub fn new(
        mux: Arc<Mux>,
        aliases: AliasConfig,
        record_set: Arc<RecordSet>,
        shuffler: Arc<dyn Shuffler<Record>>,
        recursion_available: bool,
    ) -> Result<Self, DnsError> {
        for alias in aliases.alias_hosts() {
            Name::from_ascii(&alias)
                .map_err(|e| DnsError::Config(format!("alias {alias:?}: {e}")))?;
            for target in aliases.resolutions(&alias) {
                if target.parse::<IpAddr>().is_err() {
                    Name::from_ascii(&target).map_err(|e| {
                        DnsError::Config(format!("alias {alias:?} target {target:?}: {e}"))
                    })?;
                }
            }
        }

        Ok(Self {
            mux,
            aliases,
            record_set,
            shuffler,
            recursion_available,
        })
    }

    /// Rewrite the question to `target`, recurse, and substitute the
    /// original name back into the reply.
    async fn serve_rewritten(
        &self,
        writer: &mut dyn ResponseWriter,
        request: &Message,
        target: &str,
    ) {
        let original = request.queries()[0].name().clone();
        let target_name = match Name::from_ascii(target) {
            Ok(name) => name,
            Err(e) => {
                warn!(target, error = %e, "alias target is not a valid name");
                write_response(writer, &servfail_reply(request)).await;
                return;
            }
        };

        let mut rewritten = Message::new();
        rewritten.set_id(request.id());
        rewritten.set_message_type(MessageType::Query);
        rewritten.set_op_code(request.op_code());
        rewritten.set_recursion_desired(request.recursion_desired());
        if let Some(edns) = request.extensions() {
            rewritten.set_edns(edns.clone());
        }
        let mut query = request.queries()[0].clone();
        query.set_name(target_name.clone());
        rewritten.add_query(query);

        let mut capture = CapturingWriter::mirroring(writer);
        self.mux.serve(&mut capture, &rewritten).await;

        let Some(mut inner) = capture.response else {
            return;
        };

        // Clients observe the name they asked for, in question and answers.
        let mut response = reply_to(request);
        response.set_response_code(inner.response_code());
        response.set_authoritative(inner.authoritative());
        response.set_recursion_available(inner.recursion_available());
        response.set_truncated(inner.truncated());
        for mut record in inner.take_answers() {
            if *record.name() == target_name {
                record.set_name(original.clone());
            }
            response.add_answer(record);
        }

        write_response(writer, &response).await;
    }

    /// Synthesize the alias answer directly from the record set.
    async fn serve_synthesized(
        &self,
        writer: &mut dyn ResponseWriter,
        request: &Message,
        name: &str,
    ) {
        let mut response = reply_to(request);
        response.set_authoritative(true);
        response.set_recursion_available(self.recursion_available);

        match self.record_set.resolve(name) {
            Ok(ips) => {
                let mut answers = a_records(request.queries()[0].name(), &ips);
                self.shuffler.shuffle(&mut answers);
                for answer in answers {
                    response.add_answer(answer);
                }
            }
            Err(e) => {
                warn!(name, error = %e, "alias expansion failed");
                response = servfail_reply(request);
                response.set_recursion_available(self.recursion_available);
            }
        }

        if let Err(e) = trim_to_size(&mut response, writer.udp_size_limit()) {
            warn!(error = %e, "could not size alias response");
        }
        write_response(writer, &response).await;
    }
}

#[async_trait]
impl Handler for AliasResolvingHandler {
    async fn serve(&self, writer: &mut dyn ResponseWriter, request: &Message) {
        let Some(query) = request.queries().first() else {
            self.mux.serve(writer, request).await;
            return;
        };

        let name = fqdn(&query.name().to_string());
        let targets = self.aliases.resolutions(&name);
        if targets.is_empty() {
            self.mux.serve(writer, request).await;
            return;
        }

        let timer = Timer::start();
        if targets.len() == 1 && targets[0].parse::<IpAddr>().is_err() {
            self.serve_rewritten(writer, request, &targets[0]).await;
        } else {
            self.serve_synthesized(writer, request, &name).await;
        }
        metrics::record_request("alias", RequestResult::Success, timer.elapsed());
    }
}
