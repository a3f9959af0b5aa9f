//! Single DNS exchanges with upstream recursors.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::xfer::Protocol;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::error::DnsError;

const MAX_RESPONSE_SIZE: usize = 65_535;

/// The outcome of one exchange. A truncated UDP answer still counts as an
/// answer: the partial message is returned for the client to retry over TCP.
#[derive(Debug)]
pub struct ExchangeAnswer {
    /// The response message.
    pub message: Message,
    /// Whether the response arrived with the TC bit set.
    pub truncated: bool,
}

/// Issues one DNS exchange against one upstream.
#[async_trait]
pub trait Exchanger: Send + Sync {
    /// Send `request` to `recursor` and await its response.
    async fn exchange(
        &self,
        request: &Message,
        recursor: SocketAddr,
    ) -> Result<ExchangeAnswer, DnsError>;
}

/// Network exchanger over UDP or TCP with a per-attempt timeout.
pub struct NetExchanger {
    protocol: Protocol,
    timeout: Duration,
}

impl NetExchanger {
    /// Create an exchanger for the given transport.
    pub fn new(protocol: Protocol, timeout: Duration) -> Self {
        Self { protocol, timeout }
    }
}

#[async_trait]
impl Exchanger for NetExchanger {
    async fn exchange(
        &self,
        request: &Message,
        recursor: SocketAddr,
    ) -> Result<ExchangeAnswer, DnsError> {
        let attempt = async {
            let message = match self.protocol {
                Protocol::Udp => exchange_udp(request, recursor).await?,
                Protocol::Tcp => exchange_tcp(request, recursor).await?,
                other => {
                    return Err(DnsError::Exchange(format!(
                        "unsupported exchange protocol: {other:?}"
                    )))
                }
            };

            if message.id() != request.id() {
                return Err(DnsError::Exchange(format!(
                    "mismatched message id from {recursor}"
                )));
            }

            let truncated = message.truncated();
            Ok(ExchangeAnswer { message, truncated })
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(DnsError::ExchangeTimeout { recursor }),
        }
    }
}

async fn exchange_udp(request: &Message, recursor: SocketAddr) -> Result<Message, DnsError> {
    let bind = if recursor.is_ipv4() {
        SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(recursor).await?;

    socket.send(&request.to_vec()?).await?;

    let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
    let n = socket.recv(&mut buf).await?;
    Ok(Message::from_vec(&buf[..n])?)
}

async fn exchange_tcp(request: &Message, recursor: SocketAddr) -> Result<Message, DnsError> {
    let mut stream = TcpStream::connect(recursor).await?;

    let bytes = request.to_vec()?;
    stream.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
    stream.write_all(&bytes).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Message::from_vec(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query, ResponseCode};
    use hickory_proto::rr::{Name, RecordType};

    fn query(id: u16, name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
        msg
    }

    async fn udp_responder(respond_id: Option<u16>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..n]).unwrap();
            let mut response = Message::new();
            response.set_id(respond_id.unwrap_or_else(|| request.id()));
            response.set_message_type(MessageType::Response);
            response.set_response_code(ResponseCode::NoError);
            response.add_queries(request.queries().to_vec());
            socket
                .send_to(&response.to_vec().unwrap(), peer)
                .await
                .unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_udp_exchange_round_trip() {
        let addr = udp_responder(None).await;
        let exchanger = NetExchanger::new(Protocol::Udp, Duration::from_secs(2));

        let answer = exchanger.exchange(&query(7, "example.com."), addr).await.unwrap();
        assert_eq!(answer.message.id(), 7);
        assert!(!answer.truncated);
    }

    #[tokio::test]
    async fn test_mismatched_id_is_an_error() {
        let addr = udp_responder(Some(9999)).await;
        let exchanger = NetExchanger::new(Protocol::Udp, Duration::from_secs(2));

        let err = exchanger.exchange(&query(7, "example.com."), addr).await.unwrap_err();
        assert!(matches!(err, DnsError::Exchange(_)));
    }

    #[tokio::test]
    async fn test_exchange_times_out() {
        // Nothing is listening here; the attempt must end at the budget.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let exchanger = NetExchanger::new(Protocol::Udp, Duration::from_millis(50));
        let err = exchanger.exchange(&query(7, "example.com."), addr).await.unwrap_err();
        assert!(matches!(err, DnsError::ExchangeTimeout { .. }));
    }

    #[tokio::test]
    async fn test_tcp_exchange_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf).unwrap();

            let mut response = Message::new();
            response.set_id(request.id());
            response.set_message_type(MessageType::Response);
            response.add_queries(request.queries().to_vec());
            let bytes = response.to_vec().unwrap();
            stream
                .write_all(&(bytes.len() as u16).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(&bytes).await.unwrap();
        });

        let exchanger = NetExchanger::new(Protocol::Tcp, Duration::from_secs(2));
        let answer = exchanger.exchange(&query(11, "example.com."), addr).await.unwrap();
        assert_eq!(answer.message.id(), 11);
    }
}
