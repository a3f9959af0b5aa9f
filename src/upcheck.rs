//! Validating self-query upchecks.
//!
//! An upcheck sends an A query for a pre-agreed name to the server's own
//! bind address and verifies a clean response carrying the upcheck answer.
//! The server runs one upcheck per configured name and protocol, both for
//! the startup gate and for steady-state liveness monitoring.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::xfer::Protocol;

use crate::error::DnsError;
use crate::exchanger::{Exchanger, NetExchanger};
use crate::handlers::upcheck::UPCHECK_ANSWER;
use crate::metrics;

const UPCHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// A self-query upcheck over one protocol.
pub struct AnswerValidatingUpcheck {
    target: SocketAddr,
    domain: String,
    protocol: Protocol,
}

impl AnswerValidatingUpcheck {
    /// Create an upcheck querying `domain` at `target` over `protocol`.
    pub fn new(target: SocketAddr, domain: String, protocol: Protocol) -> Self {
        Self {
            target,
            domain,
            protocol,
        }
    }

    /// Human-readable identity for logs.
    pub fn describe(&self) -> String {
        format!("{} ({:?})", self.domain, self.protocol)
    }

    /// Issue the self-query and validate the answer.
    pub async fn is_up(&self) -> Result<(), DnsError> {
        let result = self.check().await;
        metrics::record_upcheck(
            match self.protocol {
                Protocol::Tcp => "tcp",
                _ => "udp",
            },
            result.is_ok(),
        );
        result
    }

    async fn check(&self) -> Result<(), DnsError> {
        let name = Name::from_ascii(&self.domain)
            .map_err(|e| DnsError::Upcheck(format!("{}: {e}", self.domain)))?;

        let mut request = Message::new();
        request.set_id(rand::random());
        request.set_recursion_desired(true);
        request.add_query(hickory_proto::op::Query::query(name, RecordType::A));

        let exchanger = NetExchanger::new(self.protocol, UPCHECK_TIMEOUT);
        let answer = exchanger.exchange(&request, self.target).await?;

        if answer.message.response_code() != ResponseCode::NoError {
            return Err(DnsError::Upcheck(format!(
                "{} answered {:?}",
                self.describe(),
                answer.message.response_code()
            )));
        }

        let has_expected_answer = answer
            .message
            .answers()
            .iter()
            .any(|record| matches!(record.data(), RData::A(a) if Ipv4Addr::from(*a) == UPCHECK_ANSWER));
        if !has_expected_answer {
            return Err(DnsError::Upcheck(format!(
                "{} returned no upcheck answer",
                self.describe()
            )));
        }

        Ok(())
    }
}
