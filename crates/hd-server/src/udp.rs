//! UDP serving: one SO_REUSEPORT socket per core, each with a dedicated
//! receiver task and a fixed worker pool. The receiver never waits on the
//! workers — packets beyond the queue capacity are dropped so the receive
//! path stays fast under load.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use hd_codec::edns::client_max_udp_size;
use hd_codec::packet::truncate_udp_response;
use hd_ratelimit::RateLimiter;

use crate::config::ServerConfig;
use crate::handler::{QueryHandler, Transport};

/// Receive buffer per socket; also the hard ceiling on response sizes we
/// will ever send over UDP.
const UDP_BUF_SIZE: usize = 4096;

/// Kernel socket buffer sizing (4 MiB) to ride out bursts.
const SOCKET_BUF_BYTES: usize = 4 * 1024 * 1024;

type RawPacket = (Vec<u8>, SocketAddr);

pub struct UdpServer {
    sockets: Vec<Arc<UdpSocket>>,
    handler: Arc<QueryHandler>,
    limiter: Arc<RateLimiter>,
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl UdpServer {
    /// Bind all sockets up front. The first bind picks the port (relevant
    /// when the config says port 0), the rest share it via SO_REUSEPORT.
    pub fn bind(
        config: ServerConfig,
        handler: Arc<QueryHandler>,
        limiter: Arc<RateLimiter>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.listen_address, config.port)
            .parse()
            .with_context(|| format!("bad listen address {}", config.listen_address))?;

        let mut sockets = Vec::with_capacity(config.socket_count());
        let mut bound_addr = addr;
        for _ in 0..config.socket_count() {
            let socket = bind_udp_reuseport(bound_addr)?;
            bound_addr = socket.local_addr()?;
            sockets.push(Arc::new(socket));
        }

        Ok(Self {
            sockets,
            handler,
            limiter,
            config,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sockets.first().and_then(|s| s.local_addr().ok())
    }

    /// Serve until the shutdown token fires, then drain workers within
    /// the configured grace period.
    pub async fn run(self) -> Result<()> {
        let workers = self.config.workers_per_socket.max(1);
        let tracker = TaskTracker::new();

        for socket in &self.sockets {
            let (tx, rx) = mpsc::channel::<RawPacket>(2 * workers);
            let rx = Arc::new(AsyncMutex::new(rx));

            tracker.spawn(receiver_loop(
                socket.clone(),
                tx,
                self.limiter.clone(),
                self.shutdown.clone(),
            ));
            for _ in 0..workers {
                tracker.spawn(worker_loop(
                    socket.clone(),
                    rx.clone(),
                    self.handler.clone(),
                ));
            }
        }

        info!(
            "DNS UDP server listening on {} ({} sockets, {} workers each)",
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "?".to_string()),
            self.sockets.len(),
            workers,
        );

        self.shutdown.cancelled().await;
        tracker.close();
        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        if timeout(grace, tracker.wait()).await.is_err() {
            warn!("UDP workers did not drain within {:?}", grace);
        }
        Ok(())
    }
}

fn bind_udp_reuseport(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_recv_buffer_size(SOCKET_BUF_BYTES)?;
    socket.set_send_buffer_size(SOCKET_BUF_BYTES)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

async fn receiver_loop(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<RawPacket>,
    limiter: Arc<RateLimiter>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(r) => r,
                Err(err) => {
                    warn!("UDP recv error: {}", err);
                    continue;
                }
            },
        };

        // Rate limiting happens before any parsing; denied packets vanish.
        if !limiter.allow(peer.ip()) {
            continue;
        }

        // Workers saturated: drop the packet rather than block receive.
        let _ = tx.try_send((buf[..len].to_vec(), peer));
    }
}

async fn worker_loop(
    socket: Arc<UdpSocket>,
    rx: Arc<AsyncMutex<mpsc::Receiver<RawPacket>>>,
    handler: Arc<QueryHandler>,
) {
    loop {
        // Lock scope ends before handling so other workers can pull the
        // next packet while this one resolves.
        let packet = { rx.lock().await.recv().await };
        let Some((bytes, peer)) = packet else {
            break;
        };

        let result = handler.handle(Transport::Udp, peer, &bytes).await;
        if result.bytes.is_empty() {
            continue;
        }

        let max_size = result
            .request
            .as_ref()
            .map(client_max_udp_size)
            .unwrap_or(512)
            .min(UDP_BUF_SIZE);
        let response = truncate_udp_response(&result.bytes, max_size);
        if let Err(err) = socket.send_to(&response, peer).await {
            debug!("failed to send UDP response to {}: {}", peer, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hd_codec::header::{Header, FLAG_RD};
    use hd_codec::{Packet, Question, Record, RecordType};
    use hd_ratelimit::{RateLimitConfig, RateTier};
    use hd_resolver::{DnsRequest, DnsResponse, QueryContext, Resolve, ResolveError};
    use std::net::Ipv4Addr;

    /// Echoes the question with a fixed set of A records.
    struct CannedResolver {
        answer_count: usize,
    }

    #[async_trait]
    impl Resolve for CannedResolver {
        async fn resolve(
            &self,
            _ctx: &QueryContext,
            req: &DnsRequest,
        ) -> Result<DnsResponse, ResolveError> {
            let question = req.packet.first_question().ok_or(ResolveError::NoQuestion)?;
            let mut header = Header {
                id: req.packet.header.id,
                ..Default::default()
            };
            header.set_response();
            header.set_recursion_available();
            let packet = Packet {
                header,
                questions: vec![question.clone()],
                answers: (0..self.answer_count)
                    .map(|i| Record::a(&question.name, Ipv4Addr::new(10, 0, (i / 256) as u8, (i % 256) as u8), 300))
                    .collect(),
                ..Default::default()
            };
            Ok(DnsResponse {
                bytes: packet.marshal()?,
                source: "canned",
            })
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            listen_address: "127.0.0.1".to_string(),
            port: 0,
            sockets_per_transport: 1,
            workers_per_socket: 4,
            query_timeout_ms: 1000,
            shutdown_grace_ms: 1000,
            ..Default::default()
        }
    }

    fn permissive_limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(&RateLimitConfig {
            global: RateTier::disabled(),
            prefix: RateTier::disabled(),
            address: RateTier::disabled(),
            ..Default::default()
        }))
    }

    async fn start_server(
        answer_count: usize,
        limiter: Arc<RateLimiter>,
    ) -> (SocketAddr, CancellationToken) {
        let shutdown = CancellationToken::new();
        let handler = Arc::new(QueryHandler::new(
            Arc::new(CannedResolver { answer_count }),
            Duration::from_secs(1),
            shutdown.clone(),
            None,
        ));
        let server = UdpServer::bind(test_config(), handler, limiter, shutdown.clone()).unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, shutdown)
    }

    fn query_bytes(id: u16, name: &str) -> Vec<u8> {
        Packet {
            header: Header {
                id,
                flags: FLAG_RD,
                ..Default::default()
            },
            questions: vec![Question::new(name, RecordType::A)],
            ..Default::default()
        }
        .marshal()
        .unwrap()
    }

    #[tokio::test]
    async fn serves_a_query_end_to_end() {
        let (addr, shutdown) = start_server(1, permissive_limiter()).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&query_bytes(0x42, "example.com"), addr).await.unwrap();

        let mut buf = [0u8; 4096];
        let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = Packet::parse(&buf[..len]).unwrap();
        assert_eq!(response.header.id, 0x42);
        assert!(response.header.is_response());
        assert_eq!(response.answers.len(), 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn oversized_response_truncated_without_edns() {
        // 60 A records push the response well past 512 bytes.
        let (addr, shutdown) = start_server(60, permissive_limiter()).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&query_bytes(0x43, "example.com"), addr).await.unwrap();

        let mut buf = [0u8; 4096];
        let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(len <= 512);

        let response = Packet::parse(&buf[..len]).unwrap();
        assert!(response.header.is_truncated());
        assert_eq!(response.questions.len(), 1);
        assert_eq!(response.header.an_count, 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn rate_limited_queries_are_dropped() {
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig {
            global: RateTier::disabled(),
            prefix: RateTier::disabled(),
            // One packet per source, no refill to speak of.
            address: RateTier {
                rate: 0.001,
                burst: 1.0,
            },
            ..Default::default()
        }));
        let (addr, shutdown) = start_server(1, limiter).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client.send_to(&query_bytes(1, "example.com"), addr).await.unwrap();
        let mut buf = [0u8; 4096];
        timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        // Second packet is silently dropped.
        client.send_to(&query_bytes(2, "example.com"), addr).await.unwrap();
        assert!(
            timeout(Duration::from_millis(300), client.recv_from(&mut buf))
                .await
                .is_err()
        );

        shutdown.cancel();
    }
}
