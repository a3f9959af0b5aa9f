//! Server startup gating, serving, and coordinated shutdown over loopback.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use hickory_proto::xfer::Protocol;

use fleet_dns::error::DnsError;
use fleet_dns::exchanger::{Exchanger, NetExchanger};
use fleet_dns::handlers::{Handler, UpcheckHandler};
use fleet_dns::mux::Mux;
use fleet_dns::server::{DnsListener, Server, TcpDnsListener, UdpDnsListener};
use fleet_dns::upcheck::AnswerValidatingUpcheck;

use common::build_query;

const UPCHECK_DOMAIN: &str = "upcheck.fleet-dns.";

/// Find a loopback port free for both TCP and UDP.
fn free_port() -> SocketAddr {
    for _ in 0..32 {
        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = tcp.local_addr().unwrap();
        if std::net::UdpSocket::bind(addr).is_ok() {
            return addr;
        }
    }
    panic!("no loopback port free on both transports");
}

fn upcheck_mux() -> Arc<dyn Handler> {
    let mux = Arc::new(Mux::new());
    mux.handle(UPCHECK_DOMAIN, Arc::new(UpcheckHandler::new(false)));
    mux
}

fn build_server(
    addr: SocketAddr,
    bind_timeout: Duration,
) -> (Server, fleet_dns::shutdown::ShutdownTrigger) {
    let handler = upcheck_mux();
    let listeners: Vec<Arc<dyn DnsListener>> = vec![
        Arc::new(TcpDnsListener::new(addr, handler.clone())),
        Arc::new(UdpDnsListener::new(addr, handler)),
    ];
    let upchecks = vec![
        Arc::new(AnswerValidatingUpcheck::new(
            addr,
            UPCHECK_DOMAIN.to_string(),
            Protocol::Udp,
        )),
        Arc::new(AnswerValidatingUpcheck::new(
            addr,
            UPCHECK_DOMAIN.to_string(),
            Protocol::Tcp,
        )),
    ];

    let (trigger, signal) = fleet_dns::shutdown::channel();
    let server = Server::new(
        listeners,
        upchecks,
        bind_timeout,
        Duration::from_secs(5),
        trigger.clone(),
        signal,
    );
    (server, trigger)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn serves_both_transports_and_drains_on_trigger() {
    let addr = free_port();
    let (server, trigger) = build_server(addr, Duration::from_secs(5));
    let run = tokio::spawn(server.run());

    // The gate passed once an external upcheck succeeds on both transports.
    for protocol in [Protocol::Udp, Protocol::Tcp] {
        let upcheck = AnswerValidatingUpcheck::new(addr, UPCHECK_DOMAIN.to_string(), protocol);
        let mut ok = false;
        for _ in 0..100 {
            if upcheck.is_up().await.is_ok() {
                ok = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(ok, "server did not come up over {protocol:?}");
    }

    // A regular query is answered (the upcheck handler owns this domain).
    let exchanger = NetExchanger::new(Protocol::Udp, Duration::from_secs(1));
    let answer = exchanger
        .exchange(&build_query(UPCHECK_DOMAIN, RecordType::A, 77), addr)
        .await
        .unwrap();
    assert_eq!(answer.message.response_code(), ResponseCode::NoError);
    assert_eq!(answer.message.answers().len(), 1);

    trigger.trigger();
    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("server did not drain")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unanswered_upchecks_time_out_the_startup() {
    // Upchecks point at a dead port: nothing ever answers them.
    let dead = free_port();
    let upchecks = vec![Arc::new(AnswerValidatingUpcheck::new(
        dead,
        UPCHECK_DOMAIN.to_string(),
        Protocol::Udp,
    ))];

    let (trigger, signal) = fleet_dns::shutdown::channel();
    let server = Server::new(
        Vec::new(),
        upchecks,
        Duration::from_millis(300),
        Duration::from_secs(5),
        trigger,
        signal,
    );

    let err = server.run().await.unwrap_err();
    assert!(matches!(err, DnsError::BindTimeout));
    assert_eq!(err.to_string(), "timed out waiting for server to bind");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_bind_failure_fails_startup() {
    let addr = free_port();
    // Occupy the TCP side so the listener cannot bind.
    let _occupied = std::net::TcpListener::bind(addr).unwrap();

    let (server, _trigger) = build_server(addr, Duration::from_secs(2));
    let err = server.run().await.unwrap_err();
    assert!(matches!(err, DnsError::Io(_)));
}
