//! Bridges the serving sockets to the resolver chain: bounded parsing,
//! per-query deadline, FORMERR/SERVFAIL synthesis.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use hd_codec::header::{Header, RCODE_FORMERR, RCODE_SERVFAIL};
use hd_codec::packet::parse_request_bounded;
use hd_codec::{Packet, Question, HEADER_LEN};
use hd_resolver::{DnsRequest, QueryContext, Resolve};

use crate::logging::QueryLogger;

pub const SOURCE_FORMERR: &str = "formerr";
pub const SOURCE_SERVFAIL: &str = "servfail";
pub const SOURCE_TIMEOUT: &str = "timeout";
pub const SOURCE_SHUTDOWN: &str = "shutdown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

pub struct HandleResult {
    /// Response bytes to send; empty means silent drop.
    pub bytes: Vec<u8>,
    pub source: &'static str,
    /// The parsed request, when parsing got that far. Used for EDNS-aware
    /// truncation and logging.
    pub request: Option<Packet>,
}

pub struct QueryHandler {
    resolver: Arc<dyn Resolve>,
    query_timeout: Duration,
    shutdown: CancellationToken,
    logger: Option<QueryLogger>,
}

impl QueryHandler {
    pub fn new(
        resolver: Arc<dyn Resolve>,
        query_timeout: Duration,
        shutdown: CancellationToken,
        logger: Option<QueryLogger>,
    ) -> Self {
        Self {
            resolver,
            query_timeout,
            shutdown,
            logger,
        }
    }

    pub async fn handle(
        &self,
        transport: Transport,
        src: SocketAddr,
        query_bytes: &[u8],
    ) -> HandleResult {
        let started = Instant::now();

        let packet = match parse_request_bounded(query_bytes) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("malformed query from {}: {}", src, err);
                return HandleResult {
                    bytes: formerr_response(query_bytes),
                    source: SOURCE_FORMERR,
                    request: None,
                };
            }
        };

        let req = DnsRequest::new(packet.clone(), query_bytes.to_vec());
        let resolver = self.resolver.clone();
        let ctx = QueryContext::new(self.shutdown.clone());
        let (tx, rx) = oneshot::channel();
        // Resolution is not tied to this handler's lifetime: a query that
        // outlives the deadline still completes and fills the cache.
        tokio::spawn(async move {
            let _ = tx.send(resolver.resolve(&ctx, &req).await);
        });

        let (bytes, source) = tokio::select! {
            _ = self.shutdown.cancelled() => (servfail_response(&packet), SOURCE_SHUTDOWN),
            _ = tokio::time::sleep(self.query_timeout) => (servfail_response(&packet), SOURCE_TIMEOUT),
            result = rx => match result {
                Ok(Ok(response)) => (response.bytes, response.source),
                Ok(Err(err)) => {
                    debug!("resolution failed for {}: {}", src, err);
                    (servfail_response(&packet), SOURCE_SERVFAIL)
                }
                Err(_) => (servfail_response(&packet), SOURCE_SERVFAIL),
            },
        };

        if let (Some(question), Some(logger)) = (packet.first_question(), &self.logger) {
            logger.log(
                &question.name,
                &question.qtype.to_string(),
                &src.ip().to_string(),
                transport.as_str(),
                source,
                started.elapsed().as_millis() as u64,
            );
        }

        HandleResult {
            bytes,
            source,
            request: Some(packet),
        }
    }
}

/// Best-effort FORMERR: echo the header (and the question when one still
/// parses); an unparseable header means a silent drop.
fn formerr_response(query_bytes: &[u8]) -> Vec<u8> {
    let Ok(request_header) = Header::parse(query_bytes) else {
        return Vec::new();
    };

    let mut header = Header {
        id: request_header.id,
        ..Default::default()
    };
    header.set_response();
    header.set_opcode(request_header.opcode());
    header.set_rcode(RCODE_FORMERR);

    let mut questions = Vec::new();
    if request_header.qd_count >= 1 {
        let mut offset = HEADER_LEN;
        if let Ok(question) = Question::parse(query_bytes, &mut offset) {
            questions.push(question);
        }
    }

    let response = Packet {
        header,
        questions,
        ..Default::default()
    };
    response.marshal().unwrap_or_default()
}

/// SERVFAIL echoing the request's question.
fn servfail_response(request: &Packet) -> Vec<u8> {
    let mut header = Header {
        id: request.header.id,
        ..Default::default()
    };
    header.set_response();
    header.set_opcode(request.header.opcode());
    header.set_rcode(RCODE_SERVFAIL);
    if request.header.recursion_desired() {
        header.set_recursion_desired();
    }
    header.set_recursion_available();

    let response = Packet {
        header,
        questions: request.questions.clone(),
        ..Default::default()
    };
    response.marshal().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hd_codec::header::FLAG_RD;
    use hd_codec::RecordType;
    use hd_resolver::{DnsResponse, ResolveError};

    struct MockResolver {
        delay: Duration,
        outcome: Result<Vec<u8>, ResolveError>,
    }

    #[async_trait]
    impl Resolve for MockResolver {
        async fn resolve(
            &self,
            _ctx: &QueryContext,
            _req: &DnsRequest,
        ) -> Result<DnsResponse, ResolveError> {
            tokio::time::sleep(self.delay).await;
            self.outcome.clone().map(|bytes| DnsResponse {
                bytes,
                source: "mock",
            })
        }
    }

    fn handler_with(resolver: MockResolver, timeout_ms: u64) -> QueryHandler {
        QueryHandler::new(
            Arc::new(resolver),
            Duration::from_millis(timeout_ms),
            CancellationToken::new(),
            None,
        )
    }

    fn query_bytes(id: u16) -> Vec<u8> {
        Packet {
            header: Header {
                id,
                flags: FLAG_RD,
                ..Default::default()
            },
            questions: vec![Question::new("example.com", RecordType::A)],
            ..Default::default()
        }
        .marshal()
        .unwrap()
    }

    fn src() -> SocketAddr {
        "127.0.0.1:55555".parse().unwrap()
    }

    #[tokio::test]
    async fn success_passes_through() {
        let handler = handler_with(
            MockResolver {
                delay: Duration::ZERO,
                outcome: Ok(vec![0xAA; 16]),
            },
            1000,
        );
        let result = handler.handle(Transport::Udp, src(), &query_bytes(1)).await;
        assert_eq!(result.source, "mock");
        assert_eq!(result.bytes, vec![0xAA; 16]);
        assert!(result.request.is_some());
    }

    #[tokio::test]
    async fn resolver_error_becomes_servfail() {
        let handler = handler_with(
            MockResolver {
                delay: Duration::ZERO,
                outcome: Err(ResolveError::NoResolverAnswered),
            },
            1000,
        );
        let result = handler.handle(Transport::Udp, src(), &query_bytes(2)).await;
        assert_eq!(result.source, SOURCE_SERVFAIL);

        let packet = Packet::parse(&result.bytes).unwrap();
        assert_eq!(packet.header.id, 2);
        assert!(packet.header.is_response());
        assert_eq!(packet.header.rcode(), RCODE_SERVFAIL);
        assert_eq!(packet.questions.len(), 1);
        assert_eq!(packet.questions[0].name, "example.com");
    }

    #[tokio::test]
    async fn slow_resolution_hits_deadline() {
        let handler = handler_with(
            MockResolver {
                delay: Duration::from_millis(500),
                outcome: Ok(vec![1]),
            },
            50,
        );
        let result = handler.handle(Transport::Tcp, src(), &query_bytes(3)).await;
        assert_eq!(result.source, SOURCE_TIMEOUT);
        let packet = Packet::parse(&result.bytes).unwrap();
        assert_eq!(packet.header.rcode(), RCODE_SERVFAIL);
    }

    #[tokio::test]
    async fn shutdown_produces_servfail_with_shutdown_source() {
        let token = CancellationToken::new();
        token.cancel();
        let handler = QueryHandler::new(
            Arc::new(MockResolver {
                delay: Duration::from_millis(500),
                outcome: Ok(vec![1]),
            }),
            Duration::from_secs(1),
            token,
            None,
        );
        let result = handler.handle(Transport::Udp, src(), &query_bytes(4)).await;
        assert_eq!(result.source, SOURCE_SHUTDOWN);
    }

    #[tokio::test]
    async fn malformed_with_parseable_header_gets_formerr() {
        let mut bytes = query_bytes(5);
        // Claim a question the body does not carry.
        bytes[4..6].copy_from_slice(&1u16.to_be_bytes());
        bytes.truncate(14); // header + 2 junk bytes

        let handler = handler_with(
            MockResolver {
                delay: Duration::ZERO,
                outcome: Ok(vec![1]),
            },
            1000,
        );
        let result = handler.handle(Transport::Udp, src(), &bytes).await;
        assert_eq!(result.source, SOURCE_FORMERR);
        assert!(result.request.is_none());

        let packet = Packet::parse(&result.bytes).unwrap();
        assert_eq!(packet.header.id, 5);
        assert_eq!(packet.header.rcode(), RCODE_FORMERR);
        assert!(packet.header.is_response());
    }

    #[tokio::test]
    async fn unparseable_header_is_dropped_silently() {
        let handler = handler_with(
            MockResolver {
                delay: Duration::ZERO,
                outcome: Ok(vec![1]),
            },
            1000,
        );
        let result = handler.handle(Transport::Udp, src(), &[0u8; 5]).await;
        assert_eq!(result.source, SOURCE_FORMERR);
        assert!(result.bytes.is_empty());
    }

    #[tokio::test]
    async fn response_packet_rejected_with_formerr() {
        let mut bytes = query_bytes(6);
        bytes[2] |= 0x80; // QR
        let handler = handler_with(
            MockResolver {
                delay: Duration::ZERO,
                outcome: Ok(vec![1]),
            },
            1000,
        );
        let result = handler.handle(Transport::Udp, src(), &bytes).await;
        assert_eq!(result.source, SOURCE_FORMERR);
        assert!(!result.bytes.is_empty());
    }
}
