mod config;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::SIGHUP;
use signal_hook_tokio::Signals;
use tokio::sync::RwLock;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use config::HydraConfig;
use hd_policy::lists::build_engine;
use hd_ratelimit::RateLimiter;
use hd_resolver::{
    ChainResolver, CustomDnsResolver, FilterResolver, ForwardResolver, Resolve,
};
use hd_server::{QueryHandler, QueryLogger, TcpServer, UdpServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hydradns=debug".parse().unwrap()),
        )
        .init();

    info!("HydraDNS starting...");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "hydradns.json".to_string());
    let config = HydraConfig::load(Path::new(&config_path))?;

    let engine = Arc::new(RwLock::new(build_engine(&config.policy)));
    let shutdown = CancellationToken::new();

    // Resolver chain: filtering in front, then custom-local, then the
    // upstream forwarder.
    let forward = Arc::new(ForwardResolver::new(config.forward.clone()));
    let mut chain_members: Vec<Box<dyn Resolve>> = Vec::new();
    let custom = CustomDnsResolver::new(&config.custom);
    if !custom.is_empty() {
        chain_members.push(Box::new(custom));
    }
    chain_members.push(Box::new(forward.clone()));
    let chain = ChainResolver::new(chain_members);
    let resolver: Arc<dyn Resolve> =
        Arc::new(FilterResolver::new(engine.clone(), Box::new(chain)));

    // Periodic cache maintenance.
    {
        let forward = forward.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = forward.purge_expired_cache();
                        if purged > 0 {
                            debug!("purged {} expired cache entries", purged);
                        }
                    }
                }
            }
        });
    }

    let logger = if config.server.query_log_path.is_empty() {
        None
    } else {
        Some(QueryLogger::new(&config.server.query_log_path))
    };
    let handler = Arc::new(QueryHandler::new(
        resolver.clone(),
        Duration::from_millis(config.server.query_timeout_ms),
        shutdown.clone(),
        logger,
    ));
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));

    let udp = UdpServer::bind(
        config.server.clone(),
        handler.clone(),
        limiter,
        shutdown.clone(),
    )?;
    let tcp = TcpServer::bind(config.server.clone(), handler.clone(), shutdown.clone())?;
    let udp_task = tokio::spawn(udp.run());
    let tcp_task = tokio::spawn(tcp.run());

    // SIGHUP rebuilds the policy engine from the configured lists.
    {
        let engine = engine.clone();
        let policy = config.policy.clone();
        let mut signals = Signals::new([SIGHUP])?;
        tokio::spawn(async move {
            while let Some(signal) = signals.next().await {
                if signal == SIGHUP {
                    info!("SIGHUP received, reloading policy lists");
                    *engine.write().await = build_engine(&policy);
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();

    if let Err(err) = udp_task.await {
        warn!("UDP server task failed: {}", err);
    }
    if let Err(err) = tcp_task.await {
        warn!("TCP server task failed: {}", err);
    }
    if let Err(err) = resolver.shutdown().await {
        warn!("resolver shutdown failed: {}", err);
    }

    info!("HydraDNS stopped");
    Ok(())
}
