//! fleet-dns binary entry point.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hickory_proto::xfer::Protocol;
use std::path::PathBuf;
use tracing::{error, info};

use fleet_dns::aliases::AliasConfig;
use fleet_dns::config::Config;
use fleet_dns::error::DnsError;
use fleet_dns::exchanger::NetExchanger;
use fleet_dns::handlers::{
    AliasResolvingHandler, ArpaHandler, CachingHandler, DiscoveryHandler, ExchangerFactory,
    ForwardHandler, Handler, HttpJsonHandler, UpcheckHandler,
};
use fleet_dns::health::{
    self, HealthWatcher, HttpHealthChecker, NopHealthWatcher, ProbingHealthWatcher,
};
use fleet_dns::mux::{HandlerRegistrar, Mux};
use fleet_dns::records::RecordSet;
use fleet_dns::records_file::RecordFileReader;
use fleet_dns::recursors::{self, FailoverRecursorPool};
use fleet_dns::server::{DnsListener, Server, TcpDnsListener, UdpDnsListener};
use fleet_dns::shuffle::RandomShuffler;
use fleet_dns::telemetry;
use fleet_dns::upcheck::AnswerValidatingUpcheck;

/// Steady-state upcheck monitor interval.
const UPCHECK_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Authoritative-plus-recursive DNS server for fleet instance records.
#[derive(Parser, Debug)]
#[command(name = "fleet-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON).
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;

    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        address = %config.address,
        port = config.port,
        records_file = %config.records_file.display(),
        "starting fleet-dns"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "fleet-dns failed");
        return Err(e.into());
    }

    info!("fleet-dns shutdown complete");
    Ok(())
}

async fn run(config: Config) -> Result<(), DnsError> {
    let bind_address = config.bind_address()?;

    let aliases = match &config.alias_files_glob {
        Some(pattern) => AliasConfig::from_glob(pattern)?,
        None => AliasConfig::default(),
    };

    let recursor_addresses = if config.recursors.is_empty() {
        recursors::system_recursors()?
    } else {
        recursors::parse_recursor_addresses(&config.recursors)?
    };
    let recursion_available = !recursor_addresses.is_empty();

    let (trigger, signal) = fleet_dns::shutdown::channel();

    // Health watcher, probing only when enabled.
    let mut probing_watcher = None;
    let health_watcher: Arc<dyn HealthWatcher> = if config.health.enabled {
        let client = health::client_from_files(
            config.health.ca_file.as_deref(),
            config.health.certificate_file.as_deref(),
            config.health.private_key_file.as_deref(),
        )?;
        let checker = Arc::new(HttpHealthChecker::new(client, config.health.port));
        let watcher = Arc::new(ProbingHealthWatcher::new(
            checker,
            config.health.check_interval(),
        ));
        probing_watcher = Some(watcher.clone());
        watcher
    } else {
        Arc::new(NopHealthWatcher)
    };
    if let Some(watcher) = probing_watcher {
        tokio::spawn(watcher.run(signal.clone()));
    }

    // Records pipeline.
    let reader = Arc::new(RecordFileReader::new(config.records_file.clone()));
    {
        let reader = reader.clone();
        let signal = signal.clone();
        tokio::spawn(async move { reader.run(signal).await });
    }
    let record_set = RecordSet::new(
        reader,
        aliases.clone(),
        health_watcher,
        config.health.max_tracked_queries,
    )
    .await;
    let _records_task = record_set.start(signal.clone());

    // Handler composition: mux with per-domain handlers, forwarder at the
    // root, alias resolution outermost.
    let mux = Arc::new(Mux::new());
    let shuffler = Arc::new(RandomShuffler);

    mux.handle("arpa.", Arc::new(ArpaHandler::new(recursion_available)));

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    for handler_config in &config.handlers {
        if handler_config.source.kind != "http" {
            return Err(DnsError::Config(format!(
                "unsupported handler source type {:?} for {:?}",
                handler_config.source.kind, handler_config.domain
            )));
        }
        let mut handler: Arc<dyn Handler> = Arc::new(HttpJsonHandler::new(
            handler_config.source.url.clone(),
            http_client.clone(),
            recursion_available,
        ));
        if handler_config.cache.enabled {
            handler = Arc::new(CachingHandler::new(handler));
        }
        mux.handle(&handler_config.domain, handler);
    }

    let mut upchecks = Vec::new();
    let upcheck_handler = Arc::new(UpcheckHandler::new(recursion_available));
    for domain in &config.upcheck_domains {
        mux.handle(domain, upcheck_handler.clone());
        for protocol in [Protocol::Udp, Protocol::Tcp] {
            upchecks.push(Arc::new(AnswerValidatingUpcheck::new(
                bind_address,
                domain.clone(),
                protocol,
            )));
        }
    }

    let pool = Arc::new(FailoverRecursorPool::new(
        recursor_addresses,
        &RandomShuffler,
    ));
    let recursor_timeout = config.recursor_timeout();
    let exchanger_factory: ExchangerFactory =
        Arc::new(move |protocol| Arc::new(NetExchanger::new(protocol, recursor_timeout)));
    let forward_handler = Arc::new(ForwardHandler::new(
        pool,
        recursion_available,
        exchanger_factory,
    ));
    if config.cache.enabled {
        mux.handle(".", Arc::new(CachingHandler::new(forward_handler)));
    } else {
        mux.handle(".", forward_handler);
    }

    let discovery = Arc::new(DiscoveryHandler::new(
        record_set.clone(),
        shuffler.clone(),
        recursion_available,
    ));
    let registrar = HandlerRegistrar::new(mux.clone(), record_set.clone(), discovery);
    tokio::spawn(registrar.run(signal.clone()));

    let root_handler: Arc<dyn Handler> = Arc::new(AliasResolvingHandler::new(
        mux,
        aliases,
        record_set,
        shuffler,
        recursion_available,
    )?);

    let listeners: Vec<Arc<dyn DnsListener>> = vec![
        Arc::new(TcpDnsListener::new(bind_address, root_handler.clone())),
        Arc::new(UdpDnsListener::new(bind_address, root_handler)),
    ];

    // SIGTERM triggers graceful shutdown.
    {
        let trigger = trigger.clone();
        tokio::spawn(async move {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(e) => {
                        error!(error = %e, "could not install SIGTERM handler");
                        return;
                    }
                };
            sigterm.recv().await;
            info!("SIGTERM received");
            trigger.trigger();
        });
    }

    let server = Server::new(
        listeners,
        upchecks,
        config.timeout(),
        UPCHECK_MONITOR_INTERVAL,
        trigger,
        signal,
    );
    server.run().await
}
