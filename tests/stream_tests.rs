//! Tests for the streaming client against a mock upstream.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::registry_with_session;
use tether::client::{StreamEvent, StreamOptions, StreamingClient};
use tether::config::StreamConfig;
use tether::error::{Result, TetherError};
use tether::session::SessionRegistry;
use tether::types::Message;
use tether::util::RetryPolicy;

fn fast_config() -> StreamConfig {
    StreamConfig::builder()
        .request_timeout(Duration::from_secs(5))
        .retry(
            RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(10))
                .max_delay(Duration::from_millis(20))
                .build(),
        )
        .build()
}

fn client(server: &MockServer, registry: &Arc<SessionRegistry>) -> StreamingClient {
    StreamingClient::new(
        Arc::clone(registry),
        server.uri(),
        Some("test-key".to_string()),
        fast_config(),
    )
    .unwrap()
}

fn sse(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body.to_string())
}

/// An upstream that sends one chunk, then keeps the body open.
async fn stalling_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let chunk = "data: {\"content\":\"a\"}\n";
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\
                     transfer-encoding: chunked\r\n\r\n{:x}\r\n{chunk}\r\n",
                    chunk.len()
                );
                if socket.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
                tokio::time::sleep(Duration::from_secs(300)).await;
            });
        }
    });
    format!("http://{addr}")
}

fn stalled_client(base_url: String, registry: &Arc<SessionRegistry>) -> StreamingClient {
    StreamingClient::new(Arc::clone(registry), base_url, None, fast_config()).unwrap()
}

async fn collect(stream: futures::stream::BoxStream<'static, Result<Value>>) -> Vec<Result<Value>> {
    stream.collect().await
}

#[tokio::test]
async fn yields_chunks_in_order_then_ends() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/conversations"))
        .and(header("authorization", "Bearer test-key"))
        .and(header("accept", "text/event-stream"))
        .and(body_partial_json(json!({
            "message": "hi",
            "workspaceId": "w1",
            "agentId": "a1",
            "stream": true
        })))
        .respond_with(sse("data: {\"content\":\"a\"}\n\ndata: {\"content\":\"b\"}\n\n"))
        .expect(1)
        .mount(&server)
        .await;

    let (registry, session) = registry_with_session().await;
    let client = client(&server, &registry);

    let items = collect(client.stream(&session.id, Message::user("hi"), StreamOptions::default())).await;
    let chunks: Vec<Value> = items.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(chunks, vec![json!({"content": "a"}), json!({"content": "b"})]);
    assert_eq!(client.active_streams(&session.id), 0);
}

#[tokio::test]
async fn ignores_non_data_and_unparseable_lines() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/conversations"))
        .respond_with(sse(
            ": keep-alive\nevent: message\ndata: not json\ndata: {\"content\":\"x\"}\ndata: [DONE]\n",
        ))
        .mount(&server)
        .await;

    let (registry, session) = registry_with_session().await;
    let items = collect(client(&server, &registry).stream(
        &session.id,
        Message::user("hi"),
        StreamOptions::default(),
    ))
    .await;

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap(), &json!({"content": "x"}));
}

#[tokio::test]
async fn final_line_without_newline_is_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse("data: {\"content\":\"a\"}\ndata: {\"content\":\"tail\"}"))
        .mount(&server)
        .await;

    let (registry, session) = registry_with_session().await;
    let items = collect(client(&server, &registry).stream(
        &session.id,
        Message::user("hi"),
        StreamOptions::default(),
    ))
    .await;
    let contents: Vec<String> = items
        .into_iter()
        .map(|r| r.unwrap()["content"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(contents, vec!["a", "tail"]);
}

#[tokio::test]
async fn transient_failures_are_retried_with_notifications() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(sse("data: {\"content\":\"ok\"}\n"))
        .with_priority(2)
        .mount(&server)
        .await;

    let (registry, session) = registry_with_session().await;
    let client = client(&server, &registry);
    let mut events = client.subscribe();

    let items = collect(client.stream(&session.id, Message::user("hi"), StreamOptions::default())).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap(), &json!({"content": "ok"}));

    let mut retries = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let StreamEvent::Retry { attempt, delay, error, .. } = event {
            assert!(delay <= Duration::from_millis(30), "{delay:?}");
            assert!(error.contains("503"), "{error}");
            retries.push(attempt);
        }
    }
    assert_eq!(retries, vec![1, 2]);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_the_last_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let (registry, session) = registry_with_session().await;
    let items = collect(client(&server, &registry).stream(
        &session.id,
        Message::user("hi"),
        StreamOptions::default(),
    ))
    .await;

    assert_eq!(items.len(), 1);
    match &items[0] {
        Err(TetherError::UpstreamTransient { status, .. }) => assert_eq!(*status, Some(502)),
        other => panic!("expected transient error, got {other:?}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"error": {"message": "bad agent"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (registry, session) = registry_with_session().await;
    let client = client(&server, &registry);
    let mut events = client.subscribe();
    let items = collect(client.stream(&session.id, Message::user("hi"), StreamOptions::default())).await;

    match &items[..] {
        [Err(TetherError::UpstreamFatal { status, message })] => {
            assert_eq!(*status, Some(400));
            assert_eq!(message, "bad agent");
        }
        other => panic!("expected a single fatal error, got {other:?}"),
    }
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, StreamEvent::Retry { .. }));
    }
}

#[tokio::test]
async fn cancelling_the_token_aborts_in_flight_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse("data: {\"content\":\"late\"}\n").set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let (registry, session) = registry_with_session().await;
    let client = client(&server, &registry);
    let mut events = client.subscribe();
    let token = CancellationToken::new();

    let stream = client.stream(
        &session.id,
        Message::user("hi"),
        StreamOptions::builder().cancel(token.clone()).build(),
    );
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let started = std::time::Instant::now();
    let items = collect(stream).await;
    canceller.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(TetherError::Aborted)));

    let mut saw_aborted = false;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, StreamEvent::Retry { .. }));
        saw_aborted |= matches!(event, StreamEvent::Aborted { .. });
    }
    assert!(saw_aborted);
}

#[tokio::test]
async fn cancel_by_session_is_idempotent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse("data: {\"content\":\"late\"}\n").set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let (registry, session) = registry_with_session().await;
    let client = client(&server, &registry);

    let consumer = {
        let stream = client.stream(&session.id, Message::user("hi"), StreamOptions::default());
        tokio::spawn(collect(stream))
    };
    while client.active_streams(&session.id) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(client.cancel(&session.id));
    assert!(!client.cancel(&session.id));

    let items = consumer.await.unwrap();
    assert!(matches!(items[..], [Err(TetherError::Aborted)]));
    assert_eq!(client.active_streams(&session.id), 0);
}

#[tokio::test]
async fn cancelling_the_token_mid_body_ends_with_aborted() {
    let (registry, session) = registry_with_session().await;
    let client = stalled_client(stalling_upstream().await, &registry);
    let token = CancellationToken::new();

    let mut stream = client.stream(
        &session.id,
        Message::user("hi"),
        StreamOptions::builder().cancel(token.clone()).build(),
    );
    assert_eq!(stream.next().await.unwrap().unwrap(), json!({"content": "a"}));
    assert_eq!(client.active_streams(&session.id), 1);

    token.cancel();
    assert!(matches!(stream.next().await, Some(Err(TetherError::Aborted))));
    assert!(stream.next().await.is_none());
    assert_eq!(client.active_streams(&session.id), 0);
}

#[tokio::test]
async fn cancel_by_session_mid_body_ends_with_aborted() {
    let (registry, session) = registry_with_session().await;
    let client = stalled_client(stalling_upstream().await, &registry);

    let mut stream = client.stream(&session.id, Message::user("hi"), StreamOptions::default());
    assert_eq!(stream.next().await.unwrap().unwrap(), json!({"content": "a"}));

    assert!(client.cancel(&session.id));
    assert!(matches!(stream.next().await, Some(Err(TetherError::Aborted))));
    assert!(stream.next().await.is_none());
    assert_eq!(client.active_streams(&session.id), 0);
}

#[tokio::test]
async fn dropping_the_stream_early_releases_it() {
    let (registry, session) = registry_with_session().await;
    let client = stalled_client(stalling_upstream().await, &registry);

    let mut stream = client.stream(&session.id, Message::user("hi"), StreamOptions::default());
    assert_eq!(stream.next().await.unwrap().unwrap(), json!({"content": "a"}));
    assert_eq!(client.active_streams(&session.id), 1);

    drop(stream);
    assert_eq!(client.active_streams(&session.id), 0);
    assert!(!client.cancel(&session.id));
}

#[tokio::test]
async fn missing_session_fails_before_any_request() {
    let server = MockServer::start().await;
    let (registry, _) = registry_with_session().await;
    let items = collect(client(&server, &registry).stream(
        "session_missing",
        Message::user("hi"),
        StreamOptions::default(),
    ))
    .await;

    assert!(matches!(&items[..], [Err(TetherError::SessionNotFound(_))]));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn first_conversation_id_is_bound_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/conversations"))
        .respond_with(sse(
            "data: {\"conversationId\":\"c1\",\"content\":\"a\"}\n\
             data: {\"conversationId\":\"c2\",\"content\":\"b\"}\n",
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/conversations/c1/messages"))
        .respond_with(sse("data: {\"content\":\"again\"}\n"))
        .expect(1)
        .mount(&server)
        .await;

    let (registry, session) = registry_with_session().await;
    let client = client(&server, &registry);
    let mut events = client.subscribe();

    let first = collect(client.stream(&session.id, Message::user("hi"), StreamOptions::default())).await;
    assert_eq!(first.len(), 2);
    assert_eq!(
        registry.peek(&session.id).unwrap().conversation_id.as_deref(),
        Some("c1")
    );

    let second = collect(client.stream(&session.id, Message::user("more"), StreamOptions::default())).await;
    assert_eq!(second[0].as_ref().unwrap()["content"], "again");

    let mut bound = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let StreamEvent::Bound { conversation_id, .. } = event {
            bound.push(conversation_id);
        }
    }
    assert_eq!(bound, vec!["c1".to_string()]);
}

#[tokio::test]
async fn listeners_see_every_chunk_and_failures_are_isolated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse("data: {\"content\":\"a\"}\ndata: {\"content\":\"b\"}\n"))
        .mount(&server)
        .await;

    let (registry, session) = registry_with_session().await;
    let client = client(&server, &registry);
    let mut events = client.subscribe();

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let failing = client
        .add_listener(
            &session.id,
            Arc::new(|_: &str, _: &Value| -> Result<()> {
                Err(TetherError::InvalidState("listener broke".into()))
            }),
        )
        .unwrap();
    client
        .add_listener(
            &session.id,
            Arc::new(|_: &str, _: &Value| -> Result<()> { panic!("listener panicked") }),
        )
        .unwrap();
    {
        let seen = Arc::clone(&seen);
        client
            .add_listener(
                &session.id,
                Arc::new(move |_: &str, chunk: &Value| -> Result<()> {
                    seen.lock().push(chunk["content"].as_str().unwrap_or_default().to_string());
                    Ok(())
                }),
            )
            .unwrap();
    }
    assert_eq!(registry.peek(&session.id).unwrap().listeners.len(), 3);

    let items = collect(client.stream(&session.id, Message::user("hi"), StreamOptions::default())).await;
    let yielded: Vec<String> = items
        .into_iter()
        .map(|r| r.unwrap()["content"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(yielded, vec!["a", "b"]);
    assert_eq!(*seen.lock(), vec!["a", "b"]);

    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, StreamEvent::ListenerFailed { .. }) {
            failures += 1;
        }
    }
    assert_eq!(failures, 4);

    assert!(client.remove_listener(&session.id, &failing));
    assert!(!client.remove_listener(&session.id, &failing));
    assert_eq!(registry.peek(&session.id).unwrap().listeners.len(), 2);
}

#[tokio::test]
async fn listener_for_unknown_session_is_rejected() {
    let server = MockServer::start().await;
    let (registry, _) = registry_with_session().await;
    let err = client(&server, &registry)
        .add_listener(
            "session_missing",
            Arc::new(|_: &str, _: &Value| -> Result<()> { Ok(()) }),
        )
        .unwrap_err();
    assert!(matches!(err, TetherError::SessionNotFound(_)));
}
