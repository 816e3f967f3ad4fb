//! TCP serving: SO_REUSEPORT listeners, per-IP connection caps and
//! pipelined length-prefixed queries with idle timeouts.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use hd_codec::HEADER_LEN;

use crate::config::ServerConfig;
use crate::handler::{QueryHandler, Transport};

/// Listen backlog per listener.
const LISTEN_BACKLOG: i32 = 1024;

/// Tracks open connections per source IP under one mutex.
struct ConnTable {
    counts: Mutex<FxHashMap<IpAddr, usize>>,
    cap: usize,
}

impl ConnTable {
    fn new(cap: usize) -> Self {
        Self {
            counts: Mutex::new(FxHashMap::default()),
            cap,
        }
    }

    fn try_acquire(&self, ip: IpAddr) -> bool {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(ip).or_insert(0);
        if *count >= self.cap {
            return false;
        }
        *count += 1;
        true
    }

    fn release(&self, ip: IpAddr) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&ip);
            }
        }
    }
}

pub struct TcpServer {
    listeners: Vec<TcpListener>,
    handler: Arc<QueryHandler>,
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl TcpServer {
    pub fn bind(
        config: ServerConfig,
        handler: Arc<QueryHandler>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.listen_address, config.port)
            .parse()
            .with_context(|| format!("bad listen address {}", config.listen_address))?;

        let mut listeners = Vec::with_capacity(config.socket_count());
        let mut bound_addr = addr;
        for _ in 0..config.socket_count() {
            let listener = bind_tcp_reuseport(bound_addr)?;
            bound_addr = listener.local_addr()?;
            listeners.push(listener);
        }

        Ok(Self {
            listeners,
            handler,
            config,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listeners.first().and_then(|l| l.local_addr().ok())
    }

    pub async fn run(self) -> Result<()> {
        let table = Arc::new(ConnTable::new(self.config.max_tcp_connections_per_ip));
        let tracker = TaskTracker::new();

        info!(
            "DNS TCP server listening on {} ({} listeners)",
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "?".to_string()),
            self.listeners.len(),
        );

        for listener in self.listeners {
            tracker.spawn(accept_loop(
                listener,
                self.handler.clone(),
                self.config.clone(),
                table.clone(),
                tracker.clone(),
                self.shutdown.clone(),
            ));
        }

        self.shutdown.cancelled().await;
        tracker.close();
        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        if timeout(grace, tracker.wait()).await.is_err() {
            warn!("TCP connections did not drain within {:?}", grace);
        }
        Ok(())
    }
}

fn bind_tcp_reuseport(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into())?)
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<QueryHandler>,
    config: ServerConfig,
    table: Arc<ConnTable>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok(r) => r,
                Err(err) => {
                    warn!("TCP accept error: {}", err);
                    continue;
                }
            },
        };

        if !table.try_acquire(peer.ip()) {
            debug!("connection cap reached for {}, closing", peer.ip());
            drop(stream);
            continue;
        }

        let handler = handler.clone();
        let config = config.clone();
        let table = table.clone();
        tracker.spawn(async move {
            if let Err(err) = serve_connection(stream, peer, &handler, &config).await {
                debug!("TCP connection from {} ended: {}", peer, err);
            }
            table.release(peer.ip());
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: &QueryHandler,
    config: &ServerConfig,
) -> Result<()> {
    let idle = Duration::from_millis(config.tcp_idle_timeout_ms);
    let read = Duration::from_millis(config.tcp_read_timeout_ms);

    for _ in 0..config.max_queries_per_tcp_conn {
        let mut len_buf = [0u8; 2];
        match timeout(idle, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            // EOF or idle expiry both just end the connection.
            Ok(Err(_)) | Err(_) => break,
        }

        let msg_len = u16::from_be_bytes(len_buf) as usize;
        if msg_len < HEADER_LEN {
            break;
        }

        let mut query = vec![0u8; msg_len];
        timeout(read, stream.read_exact(&mut query))
            .await
            .context("query body read timed out")??;

        let result = handler.handle(Transport::Tcp, peer, &query).await;
        if result.bytes.is_empty() {
            continue;
        }
        if result.bytes.len() > u16::MAX as usize {
            break;
        }

        stream
            .write_all(&(result.bytes.len() as u16).to_be_bytes())
            .await?;
        stream.write_all(&result.bytes).await?;
    }
    Ok(())
}
