//! Listener setup and server lifecycle.
//!
//! The server starts every listener as an independent task, gates readiness
//! on the upchecks succeeding, then monitors the upchecks until shutdown.
//! A listener error during startup, or the global timeout, fails the run;
//! after readiness only the shutdown broadcast (external, or a monitor
//! exhausting its failure budget) ends it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use hickory_proto::op::Message;
use hickory_proto::xfer::Protocol;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::DnsError;
use crate::handlers::{
    emit_compressed, emit_plain, udp_size_ceiling, Handler, ResponseWriter,
};
use crate::metrics;
use crate::shutdown::{ShutdownSignal, ShutdownTrigger};
use crate::upcheck::AnswerValidatingUpcheck;

/// UDP receive buffer: the maximum DNS message size.
const UDP_BUFFER_SIZE: usize = 65_535;
/// Startup upcheck retry interval.
const UPCHECK_RETRY_INTERVAL: Duration = Duration::from_millis(50);
/// Consecutive failures a running upcheck tolerates before shutting down.
const UPCHECK_FAILURE_BUDGET: u32 = 5;

/// A bound DNS transport serving requests until told to stop.
#[async_trait]
pub trait DnsListener: Send + Sync {
    /// Bind and serve until shutdown.
    async fn listen_and_serve(&self) -> Result<(), DnsError>;

    /// Stop serving.
    async fn shutdown(&self) -> Result<(), DnsError>;
}

/// UDP listener.
pub struct UdpDnsListener {
    addr: SocketAddr,
    handler: Arc<dyn Handler>,
    stop: watch::Sender<bool>,
}

impl UdpDnsListener {
    /// Create a listener for `addr`.
    pub fn new(addr: SocketAddr, handler: Arc<dyn Handler>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            addr,
            handler,
            stop,
        }
    }
}

#[async_trait]
impl DnsListener for UdpDnsListener {
    async fn listen_and_serve(&self) -> Result<(), DnsError> {
        let socket = Arc::new(UdpSocket::bind(self.addr).await?);
        info!(addr = %self.addr, "DNS UDP listening");

        let mut stop = self.stop.subscribe();
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    debug!(addr = %self.addr, "UDP listener stopping");
                    return Ok(());
                }
                received = socket.recv_from(&mut buf) => {
                    let (n, peer) = received?;
                    match Message::from_vec(&buf[..n]) {
                        Ok(request) => {
                            let socket = socket.clone();
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                let limit = udp_size_ceiling(&request);
                                let mut writer = UdpResponseWriter { socket, peer, limit };
                                handler.serve(&mut writer, &request).await;
                            });
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "dropping unparseable datagram"),
                    }
                }
            }
        }
    }

    async fn shutdown(&self) -> Result<(), DnsError> {
        let _ = self.stop.send(true);
        Ok(())
    }
}

/// TCP listener with 2-byte big-endian length framing.
pub struct TcpDnsListener {
    addr: SocketAddr,
    handler: Arc<dyn Handler>,
    stop: watch::Sender<bool>,
}

impl TcpDnsListener {
    /// Create a listener for `addr`.
    pub fn new(addr: SocketAddr, handler: Arc<dyn Handler>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            addr,
            handler,
            stop,
        }
    }
}

#[async_trait]
impl DnsListener for TcpDnsListener {
    async fn listen_and_serve(&self) -> Result<(), DnsError> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "DNS TCP listening");

        let mut stop = self.stop.subscribe();
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    debug!(addr = %self.addr, "TCP listener stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let handler = self.handler.clone();
                    let mut conn_stop = self.stop.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = serve_tcp_connection(stream, peer, handler, &mut conn_stop).await {
                            debug!(peer = %peer, error = %e, "TCP connection ended");
                        }
                    });
                }
            }
        }
    }

    async fn shutdown(&self) -> Result<(), DnsError> {
        let _ = self.stop.send(true);
        Ok(())
    }
}

async fn serve_tcp_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn Handler>,
    stop: &mut watch::Receiver<bool>,
) -> Result<(), DnsError> {
    loop {
        let mut len_buf = [0u8; 2];
        tokio::select! {
            _ = stop.changed() => return Ok(()),
            read = stream.read_exact(&mut len_buf) => {
                // EOF here is the client closing between queries.
                if read.is_err() {
                    return Ok(());
                }
            }
        }

        let len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;

        match Message::from_vec(&buf) {
            Ok(request) => {
                let mut writer = TcpResponseWriter {
                    stream: &mut stream,
                    peer,
                };
                handler.serve(&mut writer, &request).await;
            }
            Err(e) => warn!(peer = %peer, error = %e, "dropping unparseable TCP message"),
        }
    }
}

/// Writer for UDP responses; owns the compression decision.
pub struct UdpResponseWriter {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    limit: u16,
}

impl UdpResponseWriter {
    /// Create a writer sending to `peer` under the given size ceiling.
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, limit: u16) -> Self {
        Self {
            socket,
            peer,
            limit,
        }
    }
}

#[async_trait]
impl ResponseWriter for UdpResponseWriter {
    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn udp_size_limit(&self) -> Option<u16> {
        Some(self.limit)
    }

    async fn write_msg(&mut self, response: &Message) -> Result<(), DnsError> {
        let plain = emit_plain(response)?;
        let bytes = if plain.len() > self.limit as usize {
            metrics::record_compressed_response();
            emit_compressed(response)?
        } else {
            plain
        };
        self.socket.send_to(&bytes, self.peer).await?;
        Ok(())
    }
}

/// Writer for TCP responses with length framing.
pub struct TcpResponseWriter<'a> {
    stream: &'a mut TcpStream,
    peer: SocketAddr,
}

#[async_trait]
impl ResponseWriter for TcpResponseWriter<'_> {
    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn udp_size_limit(&self) -> Option<u16> {
        None
    }

    async fn write_msg(&mut self, response: &Message) -> Result<(), DnsError> {
        let bytes = emit_plain(response)?;
        self.stream
            .write_all(&(bytes.len() as u16).to_be_bytes())
            .await?;
        self.stream.write_all(&bytes).await?;
        Ok(())
    }
}

/// The DNS server: listeners, upcheck gate, monitors, shutdown.
pub struct Server {
    listeners: Vec<Arc<dyn DnsListener>>,
    upchecks: Vec<Arc<AnswerValidatingUpcheck>>,
    bind_timeout: Duration,
    upcheck_interval: Duration,
    trigger: ShutdownTrigger,
    signal: ShutdownSignal,
}

impl Server {
    /// Assemble a server.
    pub fn new(
        listeners: Vec<Arc<dyn DnsListener>>,
        upchecks: Vec<Arc<AnswerValidatingUpcheck>>,
        bind_timeout: Duration,
        upcheck_interval: Duration,
        trigger: ShutdownTrigger,
        signal: ShutdownSignal,
    ) -> Self {
        Self {
            listeners,
            upchecks,
            bind_timeout,
            upcheck_interval,
            trigger,
            signal,
        }
    }

    /// Run until shutdown. Fails when a listener errors during startup or
    /// the upchecks do not pass within the bind timeout.
    pub async fn run(self) -> Result<(), DnsError> {
        let (err_tx, mut err_rx) = mpsc::channel::<DnsError>(self.listeners.len().max(1));
        for listener in &self.listeners {
            let listener = listener.clone();
            let err_tx = err_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = listener.listen_and_serve().await {
                    let _ = err_tx.send(e).await;
                }
            });
        }
        drop(err_tx);

        tokio::select! {
            Some(e) = err_rx.recv() => return Err(e),
            _ = tokio::time::sleep(self.bind_timeout) => return Err(DnsError::BindTimeout),
            _ = wait_until_up(&self.upchecks) => debug!("done with upchecks"),
        }

        for upcheck in &self.upchecks {
            tokio::spawn(monitor_upcheck(
                upcheck.clone(),
                self.upcheck_interval,
                self.trigger.clone(),
                self.signal.clone(),
            ));
        }
        info!("server ready");

        let mut signal = self.signal.clone();
        signal.wait().await;

        info!("shutting down listeners");
        self.shutdown_listeners().await
    }

    /// Shut every listener down in parallel; the first error wins.
    async fn shutdown_listeners(&self) -> Result<(), DnsError> {
        let results = join_all(self.listeners.iter().map(|l| l.shutdown())).await;
        results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }
}

/// Retry every upcheck until it passes; resolves when all have.
async fn wait_until_up(upchecks: &[Arc<AnswerValidatingUpcheck>]) {
    if upchecks.is_empty() {
        warn!("proceeding immediately: no upchecks configured");
        return;
    }

    join_all(upchecks.iter().map(|upcheck| async move {
        loop {
            match upcheck.is_up().await {
                Ok(()) => return,
                Err(e) => debug!(upcheck = %upcheck.describe(), error = %e, "waiting for server to come up"),
            }
            tokio::time::sleep(UPCHECK_RETRY_INTERVAL).await;
        }
    }))
    .await;
}

/// Steady-state monitor: five consecutive failures trigger shutdown.
async fn monitor_upcheck(
    upcheck: Arc<AnswerValidatingUpcheck>,
    interval: Duration,
    trigger: ShutdownTrigger,
    mut signal: ShutdownSignal,
) {
    let mut failures = 0u32;
    loop {
        tokio::select! {
            _ = signal.wait() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        match upcheck.is_up().await {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                warn!(upcheck = %upcheck.describe(), failures, error = %e, "upcheck failed");
                if failures >= UPCHECK_FAILURE_BUDGET {
                    error!(
                        upcheck = %upcheck.describe(),
                        "upcheck failure budget exhausted; shutting down"
                    );
                    trigger.trigger();
                    return;
                }
            }
        }
    }
}
