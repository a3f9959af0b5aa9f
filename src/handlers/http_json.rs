//! Handler answering a delegated domain from a dns-json HTTP source.
//!
//! The source speaks the dns-json shape: `GET {url}/?type=<n>&name=<fqdn>`
//! returns `{"Status": 0, "TC": false, "Answer": [{"name", "type", "TTL",
//! "data"}, ...]}`. Only A answers are materialized.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, Name, RData, Record};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::DnsError;
use crate::metrics::{self, RequestResult, Timer};

use super::{reply_to, servfail_reply, trim_to_size, write_response, Handler, ResponseWriter};

#[derive(Debug, Deserialize)]
struct JsonResponse {
    #[serde(rename = "Status", default)]
    status: u16,
    #[serde(rename = "TC", default)]
    truncated: bool,
    #[serde(rename = "Answer", default)]
    answers: Vec<JsonAnswer>,
}

#[derive(Debug, Deserialize)]
struct JsonAnswer {
    name: String,
    #[serde(rename = "type")]
    rr_type: u16,
    #[serde(rename = "TTL", default)]
    ttl: u32,
    data: String,
}

/// Answers one domain from an HTTP dns-json endpoint.
pub struct HttpJsonHandler {
    url: String,
    client: reqwest::Client,
    recursion_available: bool,
}

impl HttpJsonHandler {
    /// Create a handler querying `url`.
    pub fn new(url: String, client: reqwest::Client, recursion_available: bool) -> Self {
        Self {
            url,
            client,
            recursion_available,
        }
    }

    async fn fetch(&self, query: &Query) -> Result<JsonResponse, DnsError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("type", u16::from(query.query_type()).to_string()),
                ("name", query.name().to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }
}

#[async_trait]
impl Handler for HttpJsonHandler {
    async fn serve(&self, writer: &mut dyn ResponseWriter, request: &Message) {
        let timer = Timer::start();
        let mut response = reply_to(request);
        response.set_recursion_available(self.recursion_available);

        let Some(query) = request.queries().first() else {
            write_response(writer, &response).await;
            metrics::record_request("http-json", RequestResult::Empty, timer.elapsed());
            return;
        };

        match self.fetch(query).await {
            Ok(json) => {
                response.set_response_code(rcode_from_status(json.status));
                response.set_truncated(json.truncated);
                for answer in json.answers {
                    match build_a_record(&answer) {
                        Some(record) => {
                            response.add_answer(record);
                        }
                        None => debug!(
                            name = %answer.name,
                            rr_type = answer.rr_type,
                            "skipping non-A or malformed source answer"
                        ),
                    }
                }

                if let Err(e) = trim_to_size(&mut response, writer.udp_size_limit()) {
                    warn!(error = %e, "could not size http-json response");
                }
                write_response(writer, &response).await;
                metrics::record_request("http-json", RequestResult::Success, timer.elapsed());
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "http-json source failed");
                let mut failure = servfail_reply(request);
                failure.set_recursion_available(self.recursion_available);
                write_response(writer, &failure).await;
                metrics::record_request("http-json", RequestResult::Failure, timer.elapsed());
            }
        }
    }
}

fn rcode_from_status(status: u16) -> ResponseCode {
    match status {
        0 => ResponseCode::NoError,
        1 => ResponseCode::FormErr,
        2 => ResponseCode::ServFail,
        3 => ResponseCode::NXDomain,
        4 => ResponseCode::NotImp,
        5 => ResponseCode::Refused,
        _ => ResponseCode::ServFail,
    }
}

fn build_a_record(answer: &JsonAnswer) -> Option<Record> {
    if answer.rr_type != u16::from(hickory_proto::rr::RecordType::A) {
        return None;
    }
    let name = Name::from_ascii(&answer.name).ok()?;
    let addr: Ipv4Addr = answer.data.parse().ok()?;
    let mut record = Record::from_rdata(name, answer.ttl, RData::A(A::from(addr)));
    record.set_dns_class(DNSClass::IN);
    Some(record)
}
