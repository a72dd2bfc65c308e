//! Downstream execution seam.
//!
//! The engine never interprets paths or methods. Every decoded request is
//! handed to an [`Executor`] together with an explicit [`CallContext`].

use crate::error::ServerError;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use wiremux_protocol::{Handshake, Request, Response};

/// Per-call context, passed through execution and carried back with the result.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Identity of the session that sent the batch.
    pub identity: String,
    /// Identifier of the request being executed.
    pub request_id: String,
    /// Path of the request being executed.
    pub path: String,
    /// Handshake that opened the session.
    pub handshake: Option<Arc<Handshake>>,
}

/// Runs one logical request.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, request: Request, ctx: CallContext) -> Result<Response, ServerError>;
}

#[async_trait]
impl<F, Fut> Executor for F
where
    F: Fn(Request, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, ServerError>> + Send + 'static,
{
    async fn execute(&self, request: Request, ctx: CallContext) -> Result<Response, ServerError> {
        (self)(request, ctx).await
    }
}

/// Answers every request with its own body.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, request: Request, ctx: CallContext) -> Result<Response, ServerError> {
        let mut response = Response::new(ctx.request_id, 200, "OK")
            .with_path(request.path)
            .with_header("Content-Type", request.data_format);
        response.message_body = request.message_body;
        Ok(response)
    }
}
