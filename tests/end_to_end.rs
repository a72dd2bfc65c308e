//! Client and server talking over real sockets.

use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use wiremux_client::{Client, ClientError, ConnectionConfig, SessionState};
use wiremux_protocol::{
    ClientFrame, Decoder, Encoder, Handshake, HandshakeMessage, Request, RequestMessage, Response,
};
use wiremux_server::{
    CallContext, EchoExecutor, Executor, LongPollRegistry, ProtocolConfig, Server, ServerConfig,
    ServerError,
};

async fn start_server(executor: Arc<dyn Executor>) -> (Arc<Server>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::new(ServerConfig::new(addr), executor));
    let running = server.clone();
    tokio::spawn(async move { running.serve(listener).await });
    (server, addr)
}

async fn connect(addr: SocketAddr) -> Client {
    let client = Client::new(
        ConnectionConfig::new(addr).with_request_timeout(Duration::from_secs(5)),
    );
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn test_batch_answered_in_submission_order() {
    let (_server, addr) = start_server(Arc::new(EchoExecutor)).await;
    let client = connect(addr).await;

    let requests = (1..=3)
        .map(|i| Request::post("/echo").with_body(format!("echo this... {}", i)))
        .collect();
    let responses = client.send(requests).await.unwrap();

    let bodies: Vec<_> = responses.iter().filter_map(|r| r.body_str()).collect();
    assert_eq!(
        bodies,
        vec!["echo this... 1", "echo this... 2", "echo this... 3"]
    );
    assert!(responses.iter().all(|r| r.is_success()));
    assert_eq!(client.connection().pending_count(), 0);
}

#[tokio::test]
async fn test_concurrent_callers_share_connection() {
    let executor = |request: Request, ctx: CallContext| async move {
        // Later requests finish first.
        let n: u64 = request.body_str().unwrap_or("0").parse().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(50u64.saturating_sub(n * 5))).await;
        Ok::<_, ServerError>(Response::ok(ctx.request_id, n.to_string()))
    };
    let (_server, addr) = start_server(Arc::new(executor)).await;
    let client = Arc::new(connect(addr).await);

    let tasks: Vec<_> = (0..8u64)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move {
                let response = client
                    .send_one(Request::post("/").with_body(n.to_string()))
                    .await
                    .unwrap();
                assert_eq!(response.body_str(), Some(n.to_string().as_str()));
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_typed_calls() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Greeting {
        hello: String,
    }

    let executor = |request: Request, ctx: CallContext| async move {
        match request.path.as_str() {
            "/fail" => Err(ServerError::Execution("nope".to_string())),
            _ => Ok(Response::ok(
                ctx.request_id,
                serde_json::json!({ "hello": "world" }),
            )),
        }
    };
    let (_server, addr) = start_server(Arc::new(executor)).await;
    let client = connect(addr).await;

    let greeting: Greeting = client.call(Request::get("/hello")).await.unwrap();
    assert_eq!(greeting.hello, "world");

    let results = client
        .send_typed::<Greeting>(vec![Request::get("/hello"), Request::get("/fail")])
        .await
        .unwrap();
    assert!(results[0].is_ok());
    assert!(matches!(
        results[1],
        Err(ClientError::CallFailed { status: 500, .. })
    ));
}

#[tokio::test]
async fn test_second_open_rejected() {
    let (_server, addr) = start_server(Arc::new(EchoExecutor)).await;
    let client = connect(addr).await;
    let identity = client.identity().unwrap();

    assert!(matches!(
        client.connect().await,
        Err(ClientError::AlreadyOpen)
    ));
    assert_eq!(client.identity(), Some(identity));
    assert_eq!(client.send_one(Request::post("/")).await.unwrap().status_code, 200);
}

#[tokio::test]
async fn test_close_ends_session() {
    let (server, addr) = start_server(Arc::new(EchoExecutor)).await;
    let client = connect(addr).await;

    client.close().await.unwrap();
    assert_eq!(client.connection().state(), SessionState::Closed);
    assert!(matches!(
        client.send_one(Request::post("/")).await,
        Err(ClientError::NotConnected)
    ));

    while server
        .stats()
        .connections_active
        .load(std::sync::atomic::Ordering::Relaxed)
        > 0
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_server_shutdown_fails_outstanding_calls() {
    let executor = |_request: Request, ctx: CallContext| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, ServerError>(Response::ok(ctx.request_id, "late"))
    };
    let (server, addr) = start_server(Arc::new(executor)).await;
    let client = connect(addr).await;

    let calls = client
        .send_async(vec![Request::post("/slow"), Request::post("/slow")])
        .await
        .unwrap();
    assert_eq!(client.connection().pending_count(), 2);

    server.shutdown();
    for call in calls {
        assert!(matches!(call.await, Err(ClientError::ConnectionClosed)));
    }
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_long_poll_exchange() {
    let (server, _addr) = start_server(Arc::new(EchoExecutor)).await;
    let registry = LongPollRegistry::new(server.router(), ProtocolConfig::default());

    let handshake = Encoder::encode_json(&HandshakeMessage::new(Handshake::default())).unwrap();
    let identity = match Decoder::decode_client(&registry.open(&handshake).await.unwrap()).unwrap()
    {
        ClientFrame::Status(status) => {
            assert!(status.is_success());
            status.identity
        }
        other => panic!("expected status, got {:?}", other),
    };

    let batch = RequestMessage::new(
        &identity,
        vec![
            Request::post("/a").with_uuid("a").with_body("first"),
            Request::post("/b").with_uuid("b").with_body("second"),
        ],
    );
    let body = Encoder::encode_requests(&batch).unwrap();
    assert_eq!(registry.post(&identity, &body).await.unwrap(), None);

    match Decoder::decode_client(&registry.poll(&identity).await.unwrap()).unwrap() {
        ClientFrame::Responses(envelope) => {
            assert_eq!(envelope.identity, identity);
            assert_eq!(envelope.responses.len(), 2);
            let last: Vec<_> = envelope.responses.iter().filter(|r| r.last).collect();
            assert_eq!(last.len(), 1);
        }
        other => panic!("expected responses, got {:?}", other),
    }
}
