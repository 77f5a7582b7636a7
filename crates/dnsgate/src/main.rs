mod supervisor;

use dg_common::EnvConfig;
use dg_dns::logging::QueryLogger;
use dg_dns::{DnsConfig, DnsState, PolicyConfig};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::sync::Arc;
use supervisor::spawn_supervised;
use tokio_stream::StreamExt;
use tracing::info;

fn main() -> anyhow::Result<()> {
    // Reads .env into the process environment, so it must run before any thread exists
    let env = EnvConfig::load(None);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,dnsgate=debug")),
        )
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(env))
}

async fn run(env: EnvConfig) -> anyhow::Result<()> {
    info!("dnsgate starting...");

    let config = DnsConfig::load_from_file(&env.config_path)?;
    let policy = PolicyConfig::from_config(&config)?;
    let listen_addrs = config.listen_socket_addrs(env.port_override)?;

    info!(
        "Config loaded from {}: upstream {}, {} blocked suffixes, {} redirect rules, {} const domains",
        env.config_path.display(),
        policy.upstream(),
        policy.blocked_count(),
        config.redirect.iter().map(|(_, domains)| domains.len()).sum::<usize>(),
        config.constants.len() + config.echo.len(),
    );

    let query_logger = if config.query_log_path.is_empty() {
        QueryLogger::disabled()
    } else {
        info!("Query log: {}", config.query_log_path);
        QueryLogger::new(&config.query_log_path)
    };

    let dns_state: dg_dns::SharedDnsState = Arc::new(DnsState::new(policy, query_logger));

    // Bind everything up front: a port that cannot be bound stops startup
    let mut bound = Vec::with_capacity(listen_addrs.len());
    for addr in listen_addrs {
        bound.push(dg_dns::server::bind(addr).await?);
    }

    for listeners in bound {
        let state = dns_state.clone();
        let socket = listeners.udp;
        spawn_supervised("dns-udp", move || dg_dns::server::serve_udp(socket.clone(), state.clone()));

        let state = dns_state.clone();
        let listener = listeners.tcp;
        spawn_supervised("dns-tcp", move || dg_dns::server::serve_tcp(listener.clone(), state.clone()));
    }

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    if let Some(signal) = signals.next().await {
        let name = if signal == SIGINT { "SIGINT" } else { "SIGTERM" };
        info!("Received {}, shutting down", name);
    }

    Ok(())
}
