//! Batch routing.
//!
//! One inbound batch becomes one independent downstream call per request.
//! Results are fed through a [`BatchAggregator`] and whatever it releases is
//! written to the session's [`ResponseSink`].

use crate::aggregator::BatchAggregator;
use crate::error::ServerError;
use crate::executor::{CallContext, Executor};
use crate::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use wiremux_protocol::{Encoder, ErrorCode, Request, RequestMessage, Response, ResponseMessage};

/// Outbound side of a session, for frames produced after the triggering
/// frame has been handled (responses and heartbeats).
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn send_frame(&self, frame: Bytes) -> Result<(), ServerError>;

    /// Discards frames accepted but not yet handed to the peer. Called when a
    /// new identity supersedes the current one.
    fn discard_pending(&self) {}
}

/// Routes batches to an executor.
pub struct Router {
    executor: Arc<dyn Executor>,
    call_timeout: Duration,
}

impl Router {
    pub fn new(executor: Arc<dyn Executor>, call_timeout: Duration) -> Self {
        Self {
            executor,
            call_timeout,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Verifies the batch identity and starts one call per request.
    ///
    /// Fails with [`ServerError::NotAllowed`] before running anything when the
    /// identity does not match the session.
    pub async fn route(
        &self,
        session: &Session,
        batch: RequestMessage,
        sink: Arc<dyn ResponseSink>,
    ) -> Result<Vec<JoinHandle<()>>, ServerError> {
        session.verify(&batch.identity)?;

        let identity = batch.identity;
        let aggregator = Arc::new(BatchAggregator::new(
            identity.clone(),
            session.mode(),
            batch.requests.len(),
        ));

        if let Some(envelope) = aggregator.empty_reply() {
            sink.send_frame(Encoder::encode_responses(&envelope)?).await?;
            return Ok(Vec::new());
        }

        tracing::debug!(
            "Routing batch of {} request(s) (identity={})",
            batch.requests.len(),
            identity
        );

        let handshake = session.handshake();
        let handles = batch
            .requests
            .into_iter()
            .map(|request| {
                let ctx = CallContext {
                    identity: identity.clone(),
                    request_id: request_id(&request),
                    path: request.path.clone(),
                    handshake: handshake.clone(),
                };
                tokio::spawn(run_call(
                    self.executor.clone(),
                    self.call_timeout,
                    request,
                    ctx,
                    aggregator.clone(),
                    sink.clone(),
                ))
            })
            .collect();

        Ok(handles)
    }
}

fn request_id(request: &Request) -> String {
    match request.id() {
        Some(id) => id.to_string(),
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            tracing::warn!("Request without uuid, answering as {}", id);
            id
        }
    }
}

async fn run_call(
    executor: Arc<dyn Executor>,
    call_timeout: Duration,
    request: Request,
    ctx: CallContext,
    aggregator: Arc<BatchAggregator>,
    sink: Arc<dyn ResponseSink>,
) {
    let id = ctx.request_id.clone();
    let path = ctx.path.clone();

    // A panicking executor still has to complete its slot.
    let call = AssertUnwindSafe(tokio::time::timeout(
        call_timeout,
        executor.execute(request, ctx),
    ))
    .catch_unwind();

    let response = match call.await {
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("<non-string panic>");
            tracing::error!("Call {} panicked: {}", id, message);
            Response::from_code(id, ErrorCode::ServerError).with_path(path)
        }
        Ok(Ok(Ok(mut response))) => {
            response.uuid = id;
            if response.path.is_empty() {
                response.path = path;
            }
            response
        }
        Ok(Ok(Err(e))) => {
            tracing::warn!("Call {} failed: {}", id, e);
            Response::from_code(id, e.error_code()).with_path(path)
        }
        Ok(Err(_)) => {
            tracing::warn!("Call {} timed out after {:?}", id, call_timeout);
            Response::from_code(id, ErrorCode::GatewayTimeout).with_path(path)
        }
    };

    if let Some(envelope) = aggregator.complete(response) {
        flush(&envelope, sink.as_ref()).await;
    }
}

async fn flush(envelope: &ResponseMessage, sink: &dyn ResponseSink) {
    let frame = match Encoder::encode_responses(envelope) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!("Failed to encode responses: {}", e);
            return;
        }
    };
    if let Err(e) = sink.send_frame(frame).await {
        tracing::debug!(
            "Dropping {} response(s) for identity {}: {}",
            envelope.responses.len(),
            envelope.identity,
            e
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::executor::EchoExecutor;
    use crate::session::TransportMode;
    use tokio::sync::mpsc;
    use wiremux_protocol::{ClientFrame, Decoder, Handshake};

    /// Sink that forwards frames into a channel.
    pub(crate) struct ChannelSink(pub mpsc::UnboundedSender<Bytes>);

    #[async_trait]
    impl ResponseSink for ChannelSink {
        async fn send_frame(&self, frame: Bytes) -> Result<(), ServerError> {
            self.0.send(frame).map_err(|_| ServerError::ConnectionClosed)
        }
    }

    pub(crate) fn channel_sink() -> (Arc<dyn ResponseSink>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink(tx)), rx)
    }

    pub(crate) fn responses(frame: &[u8]) -> ResponseMessage {
        match Decoder::decode_client(frame).unwrap() {
            ClientFrame::Responses(batch) => batch,
            other => panic!("expected responses, got {:?}", other),
        }
    }

    fn active_session(mode: TransportMode) -> (Session, String) {
        let mut session = Session::new(mode, None);
        let identity = session.accept_handshake(Handshake::default()).unwrap();
        (session, identity)
    }

    fn batch(identity: &str, n: usize) -> RequestMessage {
        let requests = (1..=n)
            .map(|i| {
                Request::post("/echo")
                    .with_uuid(i.to_string())
                    .with_body(format!("echo this... {}", i))
            })
            .collect();
        RequestMessage::new(identity, requests)
    }

    async fn join(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_identity_mismatch_runs_nothing() {
        let (session, _) = active_session(TransportMode::Streaming);
        let (sink, mut rx) = channel_sink();
        let router = Router::new(Arc::new(EchoExecutor), Duration::from_secs(5));

        let result = router.route(&session, batch("someone-else", 2), sink).await;
        assert!(matches!(result, Err(ServerError::NotAllowed(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_streaming_one_envelope_per_response() {
        let (session, identity) = active_session(TransportMode::Streaming);
        let (sink, mut rx) = channel_sink();
        let router = Router::new(Arc::new(EchoExecutor), Duration::from_secs(5));

        join(router.route(&session, batch(&identity, 3), sink).await.unwrap()).await;

        let mut ids = Vec::new();
        let mut lasts = 0;
        for _ in 0..3 {
            let envelope = responses(&rx.recv().await.unwrap());
            assert_eq!(envelope.identity, identity);
            assert_eq!(envelope.responses.len(), 1);
            let response = &envelope.responses[0];
            assert_eq!(
                response.body_str().unwrap(),
                format!("echo this... {}", response.uuid)
            );
            lasts += response.last as usize;
            ids.push(response.uuid.clone());
        }
        ids.sort();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(lasts, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_batching_single_envelope() {
        let (session, identity) = active_session(TransportMode::Batching);
        let (sink, mut rx) = channel_sink();
        let router = Router::new(Arc::new(EchoExecutor), Duration::from_secs(5));

        join(router.route(&session, batch(&identity, 4), sink).await.unwrap()).await;

        let envelope = responses(&rx.recv().await.unwrap());
        assert_eq!(envelope.responses.len(), 4);
        assert!(envelope.responses[3].last);
        assert!(envelope.responses[..3].iter().all(|r| !r.last));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_batch_batching_mode() {
        let (session, identity) = active_session(TransportMode::Batching);
        let (sink, mut rx) = channel_sink();
        let router = Router::new(Arc::new(EchoExecutor), Duration::from_secs(5));

        let handles = router.route(&session, batch(&identity, 0), sink).await.unwrap();
        assert!(handles.is_empty());
        assert!(responses(&rx.recv().await.unwrap()).responses.is_empty());
    }

    #[tokio::test]
    async fn test_failures_become_responses() {
        let (session, identity) = active_session(TransportMode::Batching);
        let (sink, mut rx) = channel_sink();
        let executor = |request: Request, ctx: CallContext| async move {
            match request.path.as_str() {
                "/fail" => Err(ServerError::Execution("boom".to_string())),
                "/slow" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Response::ok(ctx.request_id, "late"))
                }
                _ => Ok(Response::ok(ctx.request_id, "fine")),
            }
        };
        let router = Router::new(Arc::new(executor), Duration::from_millis(50));

        let requests = vec![
            Request::post("/fail").with_uuid("a"),
            Request::post("/slow").with_uuid("b"),
            Request::post("/ok").with_uuid("c"),
        ];
        join(
            router
                .route(&session, RequestMessage::new(&identity, requests), sink)
                .await
                .unwrap(),
        )
        .await;

        let envelope = responses(&rx.recv().await.unwrap());
        let status = |id: &str| {
            envelope
                .responses
                .iter()
                .find(|r| r.uuid == id)
                .map(|r| (r.status_code, r.path.clone()))
                .unwrap()
        };
        assert_eq!(status("a"), (500, "/fail".to_string()));
        assert_eq!(status("b"), (504, "/slow".to_string()));
        assert_eq!(status("c"), (200, "/ok".to_string()));
    }

    #[tokio::test]
    async fn test_panicking_call_keeps_siblings() {
        let (session, identity) = active_session(TransportMode::Batching);
        let (sink, mut rx) = channel_sink();
        let executor = |request: Request, ctx: CallContext| async move {
            if request.path == "/panic" {
                panic!("executor blew up");
            }
            Ok::<_, ServerError>(Response::ok(ctx.request_id, "fine"))
        };
        let router = Router::new(Arc::new(executor), Duration::from_secs(5));

        let requests = vec![
            Request::post("/ok").with_uuid("a"),
            Request::post("/panic").with_uuid("b"),
        ];
        join(
            router
                .route(&session, RequestMessage::new(&identity, requests), sink)
                .await
                .unwrap(),
        )
        .await;

        let envelope = responses(&rx.recv().await.unwrap());
        assert_eq!(envelope.responses.len(), 2);
        assert_eq!(envelope.responses.iter().filter(|r| r.last).count(), 1);
        let a = envelope.responses.iter().find(|r| r.uuid == "a").unwrap();
        let b = envelope.responses.iter().find(|r| r.uuid == "b").unwrap();
        assert_eq!(a.status_code, 200);
        assert_eq!((b.status_code, b.path.as_str()), (500, "/panic"));
    }

    #[tokio::test]
    async fn test_context_carries_handshake() {
        let mut session = Session::new(TransportMode::Batching, None);
        let handshake = Handshake {
            path: Some("/bootstrap".to_string()),
            ..Default::default()
        };
        let identity = session.accept_handshake(handshake).unwrap();
        let (sink, mut rx) = channel_sink();
        let executor = |_request: Request, ctx: CallContext| async move {
            let path = ctx.handshake.as_ref().and_then(|h| h.path.clone());
            Ok::<_, ServerError>(Response::ok(ctx.request_id, path.unwrap_or_default()))
        };
        let router = Router::new(Arc::new(executor), Duration::from_secs(5));

        join(router.route(&session, batch(&identity, 1), sink).await.unwrap()).await;
        let envelope = responses(&rx.recv().await.unwrap());
        assert_eq!(envelope.responses[0].body_str(), Some("/bootstrap"));
    }
}
