//! The resolution chain: filtering, custom-local answers and upstream
//! forwarding behind one object-safe [`Resolve`] trait.

pub mod chain;
pub mod custom;
pub mod filter;
pub mod forward;
pub mod pool;

pub use chain::ChainResolver;
pub use custom::{CustomDnsConfig, CustomDnsResolver};
pub use filter::FilterResolver;
pub use forward::{ForwardConfig, ForwardResolver};

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use hd_codec::name::normalize;
use hd_codec::{Packet, Question, WireError};

// Response provenance tags, surfaced in query logs.
pub const SOURCE_CUSTOM: &str = "custom-dns";
pub const SOURCE_BLOCKED: &str = "blocked";
pub const SOURCE_UPSTREAM: &str = "upstream";
pub const SOURCE_UPSTREAM_CACHE: &str = "upstream-cache";
pub const SOURCE_UPSTREAM_INFLIGHT: &str = "upstream-inflight";

/// Cache/deduplication key for a question. Transaction ids never appear
/// here; responses are patched per client instead.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct QuestionKey {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl QuestionKey {
    pub fn from_question(question: &Question) -> Self {
        Self {
            name: normalize(&question.name),
            qtype: question.qtype.to_u16(),
            qclass: question.qclass,
        }
    }
}

/// A parsed request plus the raw bytes it came from. Forwarders reuse the
/// raw bytes rather than re-marshalling.
#[derive(Debug, Clone)]
pub struct DnsRequest {
    pub packet: Packet,
    pub raw: Vec<u8>,
}

impl DnsRequest {
    pub fn new(packet: Packet, raw: Vec<u8>) -> Self {
        Self { packet, raw }
    }
}

#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub bytes: Vec<u8>,
    pub source: &'static str,
}

/// Per-query context. Carries the server's shutdown token plus an
/// optional absolute deadline; resolvers poll the token at natural
/// waiting points and race it against in-flight upstream I/O, whose
/// waits are capped by the deadline.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub shutdown: CancellationToken,
    pub deadline: Option<Instant>,
}

impl QueryContext {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            deadline: None,
        }
    }

    /// A context that is never cancelled.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait budget for one I/O operation: the per-operation `limit`,
    /// shrunk to whatever remains before the deadline.
    pub fn io_timeout(&self, limit: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(limit),
            None => limit,
        }
    }
}

/// Cloneable so singleflight followers can share the leader's outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no question in request")]
    NoQuestion,
    #[error("name not in custom DNS configuration")]
    NotInCustomDns,
    #[error("no resolver could answer the query")]
    NoResolverAnswered,
    #[error("no upstream servers configured")]
    NoUpstreams,
    #[error("resolution canceled")]
    Canceled,
    #[error("all upstream servers failed: {0}")]
    AllUpstreamsFailed(String),
    #[error("upstream response validation failed: {0}")]
    InvalidUpstreamResponse(String),
    #[error("wire format error: {0}")]
    Wire(String),
    #[error("upstream i/o error: {0}")]
    Io(String),
}

impl From<WireError> for ResolveError {
    fn from(err: WireError) -> Self {
        Self::Wire(err.to_string())
    }
}

#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(
        &self,
        ctx: &QueryContext,
        req: &DnsRequest,
    ) -> Result<DnsResponse, ResolveError>;

    /// Release long-lived resources. Default is a no-op.
    async fn shutdown(&self) -> Result<(), ResolveError> {
        Ok(())
    }
}

#[async_trait]
impl<T: Resolve + ?Sized> Resolve for std::sync::Arc<T> {
    async fn resolve(
        &self,
        ctx: &QueryContext,
        req: &DnsRequest,
    ) -> Result<DnsResponse, ResolveError> {
        (**self).resolve(ctx, req).await
    }

    async fn shutdown(&self) -> Result<(), ResolveError> {
        (**self).shutdown().await
    }
}
