//! Policy filtering in front of the rest of the chain. Blocked names get
//! a synthesized NXDOMAIN; everything else is delegated.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use hd_codec::header::{Header, RCODE_NXDOMAIN};
use hd_codec::Packet;
use hd_policy::{PolicyAction, PolicyEngine};

use crate::{DnsRequest, DnsResponse, QueryContext, Resolve, ResolveError, SOURCE_BLOCKED};

pub struct FilterResolver {
    engine: Arc<RwLock<PolicyEngine>>,
    next: Box<dyn Resolve>,
}

impl FilterResolver {
    pub fn new(engine: Arc<RwLock<PolicyEngine>>, next: Box<dyn Resolve>) -> Self {
        Self { engine, next }
    }

    fn blocked_response(req: &DnsRequest) -> Result<DnsResponse, ResolveError> {
        let request_header = &req.packet.header;
        let mut header = Header {
            id: request_header.id,
            ..Default::default()
        };
        header.set_response();
        header.set_opcode(request_header.opcode());
        header.set_rcode(RCODE_NXDOMAIN);
        if request_header.recursion_desired() {
            header.set_recursion_desired();
            header.set_recursion_available();
        }

        let response = Packet {
            header,
            questions: req.packet.questions.clone(),
            ..Default::default()
        };
        Ok(DnsResponse {
            bytes: response.marshal()?,
            source: SOURCE_BLOCKED,
        })
    }
}

#[async_trait]
impl Resolve for FilterResolver {
    async fn resolve(
        &self,
        ctx: &QueryContext,
        req: &DnsRequest,
    ) -> Result<DnsResponse, ResolveError> {
        let Some(question) = req.packet.first_question() else {
            return self.next.resolve(ctx, req).await;
        };

        match self.engine.read().await.evaluate(&question.name) {
            PolicyAction::Block => {
                debug!("blocked {}", question.name);
                Self::blocked_response(req)
            }
            PolicyAction::Log => {
                info!("policy log match: {}", question.name);
                self.next.resolve(ctx, req).await
            }
            PolicyAction::Allow => self.next.resolve(ctx, req).await,
        }
    }

    async fn shutdown(&self) -> Result<(), ResolveError> {
        self.next.shutdown().await
    }
}
