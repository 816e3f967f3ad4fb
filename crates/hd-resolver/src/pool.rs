//! Pool of connected UDP sockets per upstream.
//!
//! Sockets are dialed up front; `get` hands one out without blocking and
//! falls back to a transient dial when the pool runs dry. Only sockets
//! that came from the pool go back into it — transient and broken ones
//! are simply dropped, which closes them.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::net::UdpSocket;
use tracing::debug;

pub struct PooledConn {
    pub socket: UdpSocket,
    pooled: bool,
}

pub struct UdpPool {
    upstream: SocketAddr,
    capacity: usize,
    idle: Mutex<VecDeque<UdpSocket>>,
}

impl UdpPool {
    /// Dial `capacity` connected sockets. Dial failures stop the fill;
    /// whatever was dialed is still usable.
    pub async fn connect(upstream: SocketAddr, capacity: usize) -> Self {
        let mut idle = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            match Self::dial(upstream).await {
                Ok(socket) => idle.push_back(socket),
                Err(err) => {
                    debug!("pool fill for {} stopped: {}", upstream, err);
                    break;
                }
            }
        }
        Self {
            upstream,
            capacity,
            idle: Mutex::new(idle),
        }
    }

    async fn dial(upstream: SocketAddr) -> io::Result<UdpSocket> {
        let bind_addr: SocketAddr = if upstream.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(upstream).await?;
        Ok(socket)
    }

    /// Take an idle socket, or dial a transient one when the pool is empty.
    pub async fn get(&self) -> io::Result<PooledConn> {
        let idle = {
            let mut guard = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            guard.pop_front()
        };
        match idle {
            Some(socket) => Ok(PooledConn {
                socket,
                pooled: true,
            }),
            None => Ok(PooledConn {
                socket: Self::dial(self.upstream).await?,
                pooled: false,
            }),
        }
    }

    /// Return a healthy pooled socket; transient sockets are closed.
    pub fn put(&self, conn: PooledConn) {
        if !conn.pooled {
            return;
        }
        let mut guard = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if guard.len() < self.capacity {
            guard.push_back(conn.socket);
        }
    }

    /// Close every idle socket.
    pub fn drain(&self) {
        let mut guard = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        guard.clear();
    }

    pub fn idle_count(&self) -> usize {
        let guard = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        guard.len()
    }
}
