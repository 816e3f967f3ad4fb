//! Upstream forwarding with response caching, singleflight deduplication,
//! upstream health tracking and TCP fallback.

use std::io;
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use hd_cache::{CacheConfig, ResponseCategory, TtlLruCache};
use hd_codec::edns::add_edns_to_request_bytes;
use hd_codec::header::{RCODE_NOERROR, RCODE_NXDOMAIN, RCODE_SERVFAIL};
use hd_codec::name::{normalize, skip_name};
use hd_codec::packet::{age_response_ttls, is_truncated, patch_transaction_id, set_transaction_id};
use hd_codec::{Packet, RData, RecordType};

use crate::pool::{PooledConn, UdpPool};
use crate::{
    DnsRequest, DnsResponse, QueryContext, QuestionKey, Resolve, ResolveError, SOURCE_UPSTREAM,
    SOURCE_UPSTREAM_CACHE, SOURCE_UPSTREAM_INFLIGHT,
};

/// An upstream that failed stays out of rotation this long.
const RECOVERY_WINDOW: Duration = Duration::from_secs(3600);

/// Upstreams beyond this are ignored.
const MAX_UPSTREAMS: usize = 3;

/// Upstream UDP read buffer.
const RECV_SIZE: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    #[serde(default = "default_upstreams")]
    pub upstreams: Vec<String>,
    #[serde(default = "default_udp_timeout_ms")]
    pub udp_timeout_ms: u64,
    #[serde(default = "default_tcp_timeout_ms")]
    pub tcp_timeout_ms: u64,
    /// Extra attempts per upstream after a timed-out read.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub tcp_fallback: bool,
    #[serde(default = "default_true")]
    pub edns_enabled: bool,
    /// Payload size advertised on queries we add an OPT to.
    #[serde(default = "default_edns_udp_size")]
    pub edns_udp_size: u16,
    /// Connected sockets kept per upstream.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_cache_entries")]
    pub cache_entries: usize,
    #[serde(default)]
    pub cache: CacheConfig,
}

fn default_upstreams() -> Vec<String> {
    vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()]
}
fn default_udp_timeout_ms() -> u64 {
    1500
}
fn default_tcp_timeout_ms() -> u64 {
    3000
}
fn default_max_retries() -> u32 {
    2
}
fn default_edns_udp_size() -> u16 {
    1232
}
fn default_pool_size() -> usize {
    256
}
fn default_cache_entries() -> usize {
    10_000
}
fn default_true() -> bool {
    true
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            upstreams: default_upstreams(),
            udp_timeout_ms: default_udp_timeout_ms(),
            tcp_timeout_ms: default_tcp_timeout_ms(),
            max_retries: default_max_retries(),
            tcp_fallback: true,
            edns_enabled: true,
            edns_udp_size: default_edns_udp_size(),
            pool_size: default_pool_size(),
            cache_entries: default_cache_entries(),
            cache: CacheConfig::default(),
        }
    }
}

/// Accepts bare IPs (port 53 assumed), `ip:port`, and bracketed or bare
/// IPv6 forms.
fn parse_upstreams(entries: &[String]) -> Vec<SocketAddr> {
    let mut upstreams: Vec<SocketAddr> = entries
        .iter()
        .filter_map(|entry| {
            if entry.contains(':') && !entry.starts_with('[') && entry.matches(':').count() > 1 {
                // IPv6 without port
                format!("[{}]:53", entry).parse().ok()
            } else if entry.contains("]:") {
                // IPv6 with port
                entry.parse().ok()
            } else if entry.contains(':') {
                // IPv4 with port
                entry.parse().ok()
            } else {
                // IPv4 without port
                format!("{}:53", entry).parse().ok()
            }
        })
        .collect();
    if upstreams.len() > MAX_UPSTREAMS {
        warn!("only the first {} upstreams are used", MAX_UPSTREAMS);
        upstreams.truncate(MAX_UPSTREAMS);
    }
    upstreams
}

/// Cache and singleflight key. The upstream component is the *preferred*
/// upstream at lookup time, so failover traffic does not overwrite the
/// primary's entries.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct FlightKey {
    question: QuestionKey,
    upstream: SocketAddr,
}

type FlightOutcome = Result<Vec<u8>, ResolveError>;

enum FlightRole {
    Leader(broadcast::Sender<FlightOutcome>),
    Follower(broadcast::Receiver<FlightOutcome>),
}

pub struct ForwardResolver {
    upstreams: Vec<SocketAddr>,
    udp_timeout: Duration,
    tcp_timeout: Duration,
    config: ForwardConfig,
    cache: TtlLruCache<FlightKey, Vec<u8>>,
    pools: AsyncMutex<FxHashMap<SocketAddr, std::sync::Arc<UdpPool>>>,
    inflight: StdMutex<FxHashMap<FlightKey, broadcast::Sender<FlightOutcome>>>,
    health: StdMutex<FxHashMap<SocketAddr, Instant>>,
}

impl ForwardResolver {
    pub fn new(config: ForwardConfig) -> Self {
        let upstreams = parse_upstreams(&config.upstreams);
        if upstreams.is_empty() {
            warn!("forwarding resolver has no usable upstreams");
        }
        let cache = TtlLruCache::new(config.cache_entries, config.cache.clone());
        Self {
            upstreams,
            udp_timeout: Duration::from_millis(config.udp_timeout_ms.max(1)),
            tcp_timeout: Duration::from_millis(config.tcp_timeout_ms.max(1)),
            config,
            cache,
            pools: AsyncMutex::new(FxHashMap::default()),
            inflight: StdMutex::new(FxHashMap::default()),
            health: StdMutex::new(FxHashMap::default()),
        }
    }

    /// Drop expired cache entries; called from the periodic maintenance
    /// task. Expiry is enforced on access either way.
    pub fn purge_expired_cache(&self) -> usize {
        self.cache.purge_expired()
    }

    /// First healthy upstream in configured order. When every upstream is
    /// cooling down the slate is wiped and the primary gets another shot.
    fn preferred_upstream(&self) -> Result<SocketAddr, ResolveError> {
        if self.upstreams.is_empty() {
            return Err(ResolveError::NoUpstreams);
        }
        let now = Instant::now();
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        for &upstream in &self.upstreams {
            match health.get(&upstream) {
                None => return Ok(upstream),
                Some(&first_failure) => {
                    if now.duration_since(first_failure) >= RECOVERY_WINDOW {
                        health.remove(&upstream);
                        return Ok(upstream);
                    }
                }
            }
        }
        health.clear();
        Ok(self.upstreams[0])
    }

    fn in_cooldown(&self, upstream: SocketAddr) -> bool {
        let health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        match health.get(&upstream) {
            Some(&first_failure) => Instant::now().duration_since(first_failure) < RECOVERY_WINDOW,
            None => false,
        }
    }

    fn mark_failed(&self, upstream: SocketAddr) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        // Keep the first failure time; the recovery window runs from it.
        health.entry(upstream).or_insert_with(Instant::now);
    }

    fn mark_healthy(&self, upstream: SocketAddr) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.remove(&upstream);
    }

    async fn pool_for(&self, upstream: SocketAddr) -> std::sync::Arc<UdpPool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&upstream) {
            return pool.clone();
        }
        let pool = std::sync::Arc::new(UdpPool::connect(upstream, self.config.pool_size).await);
        pools.insert(upstream, pool.clone());
        pool
    }

    /// Query bytes sent upstream: the client's request with the txid
    /// zeroed (so cached bytes are client-independent). With EDNS on, a
    /// client OPT carrying DO passes through; any other request goes out
    /// with an OPT at the configured payload size.
    fn prepare_query(&self, req: &DnsRequest) -> Vec<u8> {
        let mut bytes = req.raw.clone();
        set_transaction_id(&mut bytes, 0);
        if self.config.edns_enabled {
            bytes = add_edns_to_request_bytes(&req.packet, &bytes, self.config.edns_udp_size);
        }
        bytes
    }

    async fn query_and_cache(
        &self,
        ctx: &QueryContext,
        req: &DnsRequest,
        key: &FlightKey,
    ) -> FlightOutcome {
        let query = self.prepare_query(req);
        let start = self
            .upstreams
            .iter()
            .position(|&u| u == key.upstream)
            .unwrap_or(0);

        let mut last_err = String::from("no upstream attempted");
        for i in 0..self.upstreams.len() {
            if ctx.is_cancelled() {
                return Err(ResolveError::Canceled);
            }
            let upstream = self.upstreams[(start + i) % self.upstreams.len()];
            // The preferred upstream was already vetted by selection.
            if i > 0 && self.in_cooldown(upstream) {
                continue;
            }

            match self.query_one(ctx, upstream, &query).await {
                Ok(mut response) => {
                    self.mark_healthy(upstream);
                    let parsed = validate_response(&req.packet, &response)?;
                    set_transaction_id(&mut response, 0);
                    if let Some((ttl, category)) =
                        analyze_cache_decision(&parsed, self.cache.config())
                    {
                        if ttl > 0 {
                            self.cache.set(
                                key.clone(),
                                response.clone(),
                                Duration::from_secs(u64::from(ttl)),
                                category,
                            );
                        }
                    }
                    return Ok(response);
                }
                // Shutdown mid-read is not an upstream failure.
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    return Err(ResolveError::Canceled);
                }
                Err(err) => {
                    debug!("upstream {} failed: {}", upstream, err);
                    self.mark_failed(upstream);
                    last_err = format!("{}: {}", upstream, err);
                }
            }
        }
        Err(ResolveError::AllUpstreamsFailed(last_err))
    }

    async fn query_one(
        &self,
        ctx: &QueryContext,
        upstream: SocketAddr,
        query: &[u8],
    ) -> io::Result<Vec<u8>> {
        let pool = self.pool_for(upstream).await;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let conn = pool.get().await?;
            match self.exchange_udp(ctx, &conn, query).await {
                Ok(response) => {
                    if is_truncated(&response) && self.config.tcp_fallback {
                        debug!("truncated response from {}, retrying over TCP", upstream);
                        pool.put(conn);
                        return self.query_tcp(ctx, upstream, query).await;
                    }
                    pool.put(conn);
                    return Ok(response);
                }
                Err(err)
                    if err.kind() == io::ErrorKind::TimedOut
                        && attempt <= self.config.max_retries =>
                {
                    // The socket may still get a late reply; drop it and
                    // take a fresh one.
                    debug!("upstream {} timed out, retrying", upstream);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One UDP round trip. The read is bounded by `udp_timeout` shrunk to
    /// the context deadline, and races shutdown cancellation, which
    /// surfaces as `ErrorKind::Interrupted`.
    async fn exchange_udp(
        &self,
        ctx: &QueryContext,
        conn: &PooledConn,
        query: &[u8],
    ) -> io::Result<Vec<u8>> {
        conn.socket.send(query).await?;
        let mut buf = vec![0u8; RECV_SIZE];
        let read_timeout = ctx.io_timeout(self.udp_timeout);
        let len = tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "canceled during upstream read",
                ));
            }
            result = timeout(read_timeout, conn.socket.recv(&mut buf)) => result
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream read timed out"))??,
        };
        buf.truncate(len);
        Ok(buf)
    }

    async fn query_tcp(
        &self,
        ctx: &QueryContext,
        upstream: SocketAddr,
        query: &[u8],
    ) -> io::Result<Vec<u8>> {
        let deadline_err = || io::Error::new(io::ErrorKind::TimedOut, "upstream TCP timed out");
        let step_timeout = ctx.io_timeout(self.tcp_timeout);

        let exchange = async move {
            let mut stream = timeout(step_timeout, TcpStream::connect(upstream))
                .await
                .map_err(|_| deadline_err())??;

            stream
                .write_all(&(query.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(query).await?;

            let mut len_buf = [0u8; 2];
            timeout(step_timeout, stream.read_exact(&mut len_buf))
                .await
                .map_err(|_| deadline_err())??;
            let len = u16::from_be_bytes(len_buf) as usize;

            let mut response = vec![0u8; len];
            timeout(step_timeout, stream.read_exact(&mut response))
                .await
                .map_err(|_| deadline_err())??;
            Ok(response)
        };

        tokio::select! {
            _ = ctx.shutdown.cancelled() => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "canceled during upstream TCP query",
            )),
            result = exchange => result,
        }
    }
}

#[async_trait]
impl Resolve for ForwardResolver {
    async fn resolve(
        &self,
        ctx: &QueryContext,
        req: &DnsRequest,
    ) -> Result<DnsResponse, ResolveError> {
        let question = req
            .packet
            .first_question()
            .ok_or(ResolveError::NoQuestion)?;
        let client_id = req.packet.header.id;
        let key = FlightKey {
            question: QuestionKey::from_question(question),
            upstream: self.preferred_upstream()?,
        };

        if let Some((mut bytes, age, _)) = self.cache.get(&key) {
            if let Err(err) = age_response_ttls(&mut bytes, age.as_secs() as u32) {
                warn!("failed to age cached response: {}", err);
            }
            set_transaction_id(&mut bytes, client_id);
            return Ok(DnsResponse {
                bytes,
                source: SOURCE_UPSTREAM_CACHE,
            });
        }

        if ctx.is_cancelled() {
            return Err(ResolveError::Canceled);
        }

        let role = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match inflight.get(&key) {
                Some(tx) => FlightRole::Follower(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    inflight.insert(key.clone(), tx.clone());
                    FlightRole::Leader(tx)
                }
            }
        };

        match role {
            FlightRole::Follower(mut rx) => {
                let outcome = tokio::select! {
                    _ = ctx.shutdown.cancelled() => return Err(ResolveError::Canceled),
                    outcome = rx.recv() => outcome,
                };
                match outcome {
                    Ok(Ok(bytes)) => Ok(DnsResponse {
                        bytes: patch_transaction_id(&bytes, client_id),
                        source: SOURCE_UPSTREAM_INFLIGHT,
                    }),
                    Ok(Err(err)) => Err(err),
                    // The leader vanished without publishing; query alone.
                    Err(_) => self.query_and_cache(ctx, req, &key).await.map(|bytes| {
                        DnsResponse {
                            bytes: patch_transaction_id(&bytes, client_id),
                            source: SOURCE_UPSTREAM,
                        }
                    }),
                }
            }
            FlightRole::Leader(tx) => {
                let outcome = self.query_and_cache(ctx, req, &key).await;
                {
                    let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
                    inflight.remove(&key);
                }
                let _ = tx.send(outcome.clone());
                outcome.map(|bytes| DnsResponse {
                    bytes: patch_transaction_id(&bytes, client_id),
                    source: SOURCE_UPSTREAM,
                })
            }
        }
    }

    async fn shutdown(&self) -> Result<(), ResolveError> {
        let pools = self.pools.lock().await;
        for pool in pools.values() {
            pool.drain();
        }
        Ok(())
    }
}

/// A response is only trusted (and cached) when it echoes the question we
/// asked: same name modulo case and trailing dot, same type, same class.
fn validate_response(request: &Packet, response_bytes: &[u8]) -> Result<Packet, ResolveError> {
    let request_q = request
        .first_question()
        .ok_or(ResolveError::NoQuestion)?;
    let response = Packet::parse(response_bytes)
        .map_err(|err| ResolveError::InvalidUpstreamResponse(format!("unparseable: {}", err)))?;
    let response_q = response.first_question().ok_or_else(|| {
        ResolveError::InvalidUpstreamResponse("response carries no question".to_string())
    })?;

    if normalize(&response_q.name) != normalize(&request_q.name) {
        return Err(ResolveError::InvalidUpstreamResponse(format!(
            "QNAME mismatch: asked {}, got {}",
            request_q.name, response_q.name
        )));
    }
    if response_q.qtype != request_q.qtype {
        return Err(ResolveError::InvalidUpstreamResponse(format!(
            "QTYPE mismatch: asked {}, got {}",
            request_q.qtype, response_q.qtype
        )));
    }
    if response_q.qclass != request_q.qclass {
        return Err(ResolveError::InvalidUpstreamResponse(format!(
            "QCLASS mismatch: asked {}, got {}",
            request_q.qclass, response_q.qclass
        )));
    }
    Ok(response)
}

/// Decide whether and how long to cache a validated response (RFC 2308
/// for the negative cases). `None` means do not cache; a zero TTL is
/// likewise dropped by the caller.
fn analyze_cache_decision(
    response: &Packet,
    cache_config: &CacheConfig,
) -> Option<(u32, ResponseCategory)> {
    let default_negative = cache_config.default_negative_ttl_secs as u32;
    match response.header.rcode() {
        RCODE_SERVFAIL => Some((
            cache_config.servfail_ttl_secs as u32,
            ResponseCategory::Servfail,
        )),
        RCODE_NXDOMAIN => Some((
            soa_minimum(&response.authorities).unwrap_or(default_negative),
            ResponseCategory::Nxdomain,
        )),
        RCODE_NOERROR => {
            if response.answers.is_empty() {
                Some((
                    soa_minimum(&response.authorities).unwrap_or(default_negative),
                    ResponseCategory::Nodata,
                ))
            } else {
                let ttl = response
                    .answers
                    .iter()
                    .map(|record| record.ttl)
                    .filter(|&ttl| ttl > 0)
                    .min()
                    .unwrap_or(0);
                Some((ttl, ResponseCategory::Positive))
            }
        }
        _ => None,
    }
}

/// SOA MINIMUM out of the first SOA in the authority section: skip the
/// two embedded names, then SERIAL/REFRESH/RETRY/EXPIRE (4 bytes each),
/// then read the 32-bit MINIMUM.
fn soa_minimum(authorities: &[hd_codec::Record]) -> Option<u32> {
    for record in authorities {
        if record.rtype != RecordType::SOA {
            continue;
        }
        let RData::Opaque(rdata) = &record.rdata else {
            continue;
        };
        let mut pos = 0;
        skip_name(rdata, &mut pos).ok()?; // MNAME
        skip_name(rdata, &mut pos).ok()?; // RNAME
        let minimum_at = pos + 16;
        if minimum_at + 4 > rdata.len() {
            return None;
        }
        return Some(u32::from_be_bytes([
            rdata[minimum_at],
            rdata[minimum_at + 1],
            rdata[minimum_at + 2],
            rdata[minimum_at + 3],
        ]));
    }
    None
}
