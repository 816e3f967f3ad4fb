//! Sequential try-until-success composition of resolvers.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{DnsRequest, DnsResponse, QueryContext, Resolve, ResolveError};

pub struct ChainResolver {
    children: Vec<Box<dyn Resolve>>,
}

impl ChainResolver {
    pub fn new(children: Vec<Box<dyn Resolve>>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl Resolve for ChainResolver {
    async fn resolve(
        &self,
        ctx: &QueryContext,
        req: &DnsRequest,
    ) -> Result<DnsResponse, ResolveError> {
        let mut last_err = None;
        for child in &self.children {
            if ctx.is_cancelled() {
                return Err(ResolveError::Canceled);
            }
            match child.resolve(ctx, req).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    debug!("chain member failed: {}", err);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(ResolveError::NoResolverAnswered))
    }

    async fn shutdown(&self) -> Result<(), ResolveError> {
        let mut result = Ok(());
        for child in &self.children {
            if let Err(err) = child.shutdown().await {
                warn!("resolver shutdown failed: {}", err);
                result = Err(err);
            }
        }
        result
    }
}
