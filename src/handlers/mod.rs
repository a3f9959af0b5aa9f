//! DNS request handlers and the interfaces they share.
//!
//! Every handler implements one operation, `serve(writer, request)`, so
//! composition is by wrapping: the alias handler wraps the mux, the caching
//! handler wraps any inner handler. Writers own the UDP compression
//! decision; local handlers trim oversized answers instead.

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, Name, RData, Record};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder, EncodeMode};
use hickory_proto::xfer::Protocol;
use tracing::error;

use crate::error::DnsError;

pub mod alias;
pub mod arpa;
pub mod cache;
pub mod discovery;
pub mod forward;
pub mod http_json;
pub mod upcheck;

pub use alias::AliasResolvingHandler;
pub use arpa::ArpaHandler;
pub use cache::CachingHandler;
pub use discovery::DiscoveryHandler;
pub use forward::{ExchangerFactory, ForwardHandler};
pub use http_json::HttpJsonHandler;
pub use upcheck::UpcheckHandler;

/// Default UDP payload ceiling when the request carries no OPT record.
pub const DEFAULT_UDP_SIZE: u16 = 512;

/// Serves one DNS request.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Produce and write the response for `request`.
    async fn serve(&self, writer: &mut dyn ResponseWriter, request: &Message);
}

/// Writes responses back to the client.
#[async_trait]
pub trait ResponseWriter: Send {
    /// The client's address.
    fn remote_addr(&self) -> SocketAddr;

    /// The transport the request arrived over.
    fn protocol(&self) -> Protocol;

    /// The UDP payload ceiling for this response; `None` over TCP.
    fn udp_size_limit(&self) -> Option<u16>;

    /// Emit one response message.
    async fn write_msg(&mut self, response: &Message) -> Result<(), DnsError>;
}

/// Write a response, logging and dropping it on failure.
pub(crate) async fn write_response(writer: &mut dyn ResponseWriter, response: &Message) {
    if let Err(e) = writer.write_msg(response).await {
        error!(error = %e, "error writing response");
    }
}

/// A reply mirroring the request's id, opcode, RD flag, and question.
pub fn reply_to(request: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.add_queries(request.queries().to_vec());
    response
}

/// A ServFail reply to the request.
pub fn servfail_reply(request: &Message) -> Message {
    let mut response = reply_to(request);
    response.set_response_code(ResponseCode::ServFail);
    response
}

/// The effective UDP size ceiling: 512 unless the request's OPT record
/// advertises a larger buffer.
pub fn udp_size_ceiling(request: &Message) -> u16 {
    match request.extensions() {
        Some(edns) if edns.max_payload() > DEFAULT_UDP_SIZE => edns.max_payload(),
        _ => DEFAULT_UDP_SIZE,
    }
}

/// Emit without name compression. The plain length is what the compression
/// decision compares against the UDP ceiling.
pub fn emit_plain(message: &Message) -> Result<Vec<u8>, DnsError> {
    let mut buffer = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::with_mode(&mut buffer, EncodeMode::Signing);
        encoder.set_max_size(u16::MAX);
        message.emit(&mut encoder)?;
    }
    Ok(buffer)
}

/// Emit with name compression.
pub fn emit_compressed(message: &Message) -> Result<Vec<u8>, DnsError> {
    let mut buffer = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut buffer);
        encoder.set_max_size(u16::MAX);
        message.emit(&mut encoder)?;
    }
    Ok(buffer)
}

/// Drop answers until the response fits the UDP ceiling, setting TC once
/// anything was dropped. A no-op over TCP.
pub fn trim_to_size(response: &mut Message, limit: Option<u16>) -> Result<(), DnsError> {
    let Some(limit) = limit else {
        return Ok(());
    };

    while !response.answers().is_empty() && emit_plain(response)?.len() > limit as usize {
        let mut answers = response.take_answers();
        answers.pop();
        response.insert_answers(answers);
        response.set_truncated(true);
    }

    Ok(())
}

/// Build TTL-0 A records for `name` from textual IPs. Entries that are not
/// IPv4 are skipped.
pub fn a_records(name: &Name, ips: &[String]) -> Vec<Record> {
    ips.iter()
        .filter_map(|ip| {
            let addr: Ipv4Addr = ip.parse().ok()?;
            let mut record = Record::from_rdata(name.clone(), 0, RData::A(A::from(addr)));
            record.set_dns_class(DNSClass::IN);
            Some(record)
        })
        .collect()
}

/// Writer that captures the response instead of sending it, mirroring the
/// outer writer's client address, protocol, and size ceiling. Used by
/// wrapping handlers that post-process an inner handler's reply.
pub struct CapturingWriter {
    remote: SocketAddr,
    protocol: Protocol,
    limit: Option<u16>,
    /// The captured response, if the inner handler wrote one.
    pub response: Option<Message>,
}

impl CapturingWriter {
    /// A capturing writer presenting the given client.
    pub fn new(remote: SocketAddr, protocol: Protocol, limit: Option<u16>) -> Self {
        Self {
            remote,
            protocol,
            limit,
            response: None,
        }
    }

    /// A capturing writer presenting the same client as `writer`.
    pub fn mirroring(writer: &dyn ResponseWriter) -> Self {
        Self::new(
            writer.remote_addr(),
            writer.protocol(),
            writer.udp_size_limit(),
        )
    }
}

#[async_trait]
impl ResponseWriter for CapturingWriter {
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
        self.response = Some(response.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Edns, OpCode, Query};
    use hickory_proto::rr::RecordType;

    fn request(name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(42);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
        msg
    }

    #[test]
    fn test_reply_mirrors_request() {
        let req = request("x.bosh.");
        let reply = reply_to(&req);
        assert_eq!(reply.id(), 42);
        assert_eq!(reply.message_type(), MessageType::Response);
        assert!(reply.recursion_desired());
        assert_eq!(reply.queries(), req.queries());
    }

    #[test]
    fn test_udp_size_ceiling_defaults_to_512() {
        assert_eq!(udp_size_ceiling(&request("x.bosh.")), 512);
    }

    #[test]
    fn test_udp_size_ceiling_honors_larger_opt() {
        let mut req = request("x.bosh.");
        req.extensions_mut()
            .get_or_insert_with(Edns::new)
            .set_max_payload(1024);
        assert_eq!(udp_size_ceiling(&req), 1024);
    }

    #[test]
    fn test_udp_size_ceiling_ignores_smaller_opt() {
        let mut req = request("x.bosh.");
        req.extensions_mut()
            .get_or_insert_with(Edns::new)
            .set_max_payload(300);
        assert_eq!(udp_size_ceiling(&req), 512);
    }

    #[test]
    fn test_plain_emission_is_longer_than_compressed_for_repeated_names() {
        let mut msg = reply_to(&request("a-very-long-instance-name.some-group.bosh."));
        let name = Name::from_ascii("a-very-long-instance-name.some-group.bosh.").unwrap();
        let ips: Vec<String> = (0..20).map(|i| format!("10.0.0.{i}")).collect();
        for record in a_records(&name, &ips) {
            msg.add_answer(record);
        }

        let plain = emit_plain(&msg).unwrap();
        let compressed = emit_compressed(&msg).unwrap();
        assert!(compressed.len() < plain.len());
        // Both emissions parse back to the same answer count.
        assert_eq!(Message::from_vec(&plain).unwrap().answers().len(), 20);
        assert_eq!(Message::from_vec(&compressed).unwrap().answers().len(), 20);
    }

    #[test]
    fn test_trim_to_size_drops_answers_and_sets_tc() {
        let name = Name::from_ascii("a-very-long-instance-name.some-group.bosh.").unwrap();
        let mut msg = reply_to(&request("a-very-long-instance-name.some-group.bosh."));
        let ips: Vec<String> = (0..40).map(|i| format!("10.0.1.{i}")).collect();
        for record in a_records(&name, &ips) {
            msg.add_answer(record);
        }
        assert!(emit_plain(&msg).unwrap().len() > 512);

        trim_to_size(&mut msg, Some(512)).unwrap();
        assert!(msg.truncated());
        assert!(emit_plain(&msg).unwrap().len() <= 512);
        assert!(!msg.answers().is_empty());

        let mut untouched = reply_to(&request("x.bosh."));
        trim_to_size(&mut untouched, None).unwrap();
        assert!(!untouched.truncated());
    }

    #[test]
    fn test_a_records_skip_non_ipv4() {
        let name = Name::from_ascii("x.bosh.").unwrap();
        let records = a_records(
            &name,
            &["10.0.0.1".to_string(), "not-an-ip".to_string(), "fd00::1".to_string()],
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type(), RecordType::A);
    }
}
