//! End-to-end forwarding through `ReverseProxy` against local upstreams.

mod common;

use bifrost_fastproxy::config::TransportSettings;
use bifrost_fastproxy::connection::BoxedIo;
use bifrost_fastproxy::outbound::RewriteOptions;
use bifrost_fastproxy::pool::DialFuture;
use bifrost_fastproxy::{ConnectionPool, DialFn, ProxyError, RemoteAddr, ReverseProxy};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::{Request, StatusCode};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use url::Url;

async fn body_text(response: hyper::Response<bifrost_fastproxy::body::ProxyBody>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn target(addr: SocketAddr) -> Url {
    Url::parse(&format!("http://{}", addr)).unwrap()
}

#[tokio::test]
async fn test_get_is_forwarded_with_scrubbed_headers() {
    let upstream = common::spawn_echo_upstream().await;
    let builder = common::default_builder();
    let proxy = builder.build("default", &target(upstream), false, false).unwrap();

    let mut req = Request::get("/items?id=7")
        .header("host", "public.example.com")
        .header("connection", "keep-alive, x-hop")
        .header("x-hop", "drop me")
        .header("keep-alive", "timeout=5")
        .header("te", "trailers")
        .header("x-end-to-end", "keep me")
        .body(Empty::<Bytes>::new())
        .unwrap();
    req.extensions_mut().insert(RemoteAddr("192.0.2.10:40000".to_string()));

    let response = proxy.serve(req).await;
    assert_eq!(response.status(), StatusCode::OK);
    let text = body_text(response).await;

    assert!(text.starts_with("GET /items?id=7\n"), "{}", text);
    assert!(text.contains(&format!("host: {}\n", upstream)));
    assert!(text.contains("x-end-to-end: keep me\n"));
    assert!(text.contains("te: trailers\n"));
    assert!(text.contains("x-forwarded-for: 192.0.2.10\n"));
    assert!(!text.contains("x-hop"));
    assert!(!text.contains("keep-alive: timeout"));
}

#[tokio::test]
async fn test_pass_host_header() {
    let upstream = common::spawn_echo_upstream().await;
    let builder = common::default_builder();
    let proxy = builder.build("default", &target(upstream), true, false).unwrap();

    let req = Request::get("/")
        .header("host", "public.example.com")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let text = body_text(proxy.serve(req).await).await;
    assert!(text.contains("host: public.example.com\n"), "{}", text);
}

#[tokio::test]
async fn test_preserve_path_and_query_rewrite() {
    let upstream = common::spawn_echo_upstream().await;
    let builder = common::default_builder();
    let base = Url::parse(&format!("http://{}/base", upstream)).unwrap();
    let proxy = builder.build("default", &base, false, true).unwrap();

    let req = Request::get("/foo%2Fbar?a=1;b=2").body(Empty::<Bytes>::new()).unwrap();
    let text = body_text(proxy.serve(req).await).await;
    assert!(text.starts_with("GET /base/foo%2Fbar?a=1&b=2\n"), "{}", text);
}

#[tokio::test]
async fn test_request_bodies_are_framed() {
    let upstream = common::spawn_echo_upstream().await;
    let builder = common::default_builder();
    let proxy = builder.build("default", &target(upstream), false, false).unwrap();

    let req = Request::post("/upload")
        .body(Full::new(Bytes::from_static(b"fixed body")))
        .unwrap();
    let text = body_text(proxy.serve(req).await).await;
    assert!(text.contains("content-length: 10\n"), "{}", text);
    assert!(text.ends_with("\nfixed body"));

    let frames: Vec<Result<Frame<Bytes>, io::Error>> = vec![
        Ok(Frame::data(Bytes::from_static(b"streamed "))),
        Ok(Frame::data(Bytes::from_static(b"body"))),
    ];
    let req = Request::post("/upload")
        .body(StreamBody::new(futures::stream::iter(frames)))
        .unwrap();
    let text = body_text(proxy.serve(req).await).await;
    assert!(text.contains("transfer-encoding: chunked\n"), "{}", text);
    assert!(text.ends_with("\nstreamed body"));
}

#[tokio::test]
async fn test_connections_are_reused() {
    let upstream = common::spawn_echo_upstream().await;
    let builder = common::default_builder();
    let proxy = builder.build("default", &target(upstream), false, false).unwrap();

    for _ in 0..3 {
        let req = Request::get("/").body(Empty::<Bytes>::new()).unwrap();
        let response = proxy.serve(req).await;
        assert_eq!(response.status(), StatusCode::OK);
        body_text(response).await;
        assert!(common::eventually(|| proxy.pool().stats().idle == 1).await);
    }
    assert_eq!(proxy.pool().stats().dials, 1);
    assert_eq!(proxy.pool().stats().reused, 2);
}

#[tokio::test]
async fn test_connection_close_response_is_not_reused() {
    let (upstream, _heads) = common::spawn_raw_upstream(
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
        true,
    )
    .await;
    let builder = common::default_builder();
    let proxy = builder.build("default", &target(upstream), false, false).unwrap();

    for _ in 0..2 {
        let response = proxy.serve(Request::get("/").body(Empty::<Bytes>::new()).unwrap()).await;
        assert!(!response.headers().contains_key("connection"));
        assert_eq!(body_text(response).await, "ok");
    }
    assert_eq!(proxy.pool().stats().dials, 2);
    assert_eq!(proxy.pool().stats().idle, 0);
}

#[tokio::test]
async fn test_idle_connection_closed_by_upstream_is_not_reused() {
    use tokio::io::AsyncWriteExt;

    // Keep-alive response, then the upstream hangs up shortly after.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                common::read_head(&mut stream).await;
                let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
                tokio::time::sleep(Duration::from_millis(50)).await;
            });
        }
    });
    let builder = common::default_builder();
    let proxy = builder.build("default", &target(upstream), false, false).unwrap();

    let response = proxy.serve(Request::get("/").body(Empty::<Bytes>::new()).unwrap()).await;
    assert_eq!(body_text(response).await, "ok");
    assert!(common::eventually(|| proxy.pool().stats().idle == 1).await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let response = proxy.serve(Request::get("/").body(Empty::<Bytes>::new()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");

    let stats = proxy.pool().stats();
    assert_eq!(stats.dials, 2);
    assert_eq!(stats.reused, 0);
    assert_eq!(stats.evicted, 1);
}

#[tokio::test]
async fn test_chunked_response_with_trailers() {
    let (upstream, _heads) = common::spawn_raw_upstream(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nTrailer: X-Digest\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\nX-Digest: abc123\r\n\r\n",
        false,
    )
    .await;
    let builder = common::default_builder();
    let proxy = builder.build("default", &target(upstream), false, false).unwrap();

    let response = proxy.serve(Request::get("/").body(Empty::<Bytes>::new()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key("transfer-encoding"));
    let collected = response.into_body().collect().await.unwrap();
    assert_eq!(collected.trailers().unwrap()["x-digest"], "abc123");
    assert_eq!(&collected.to_bytes()[..], b"wikipedia");
}

#[tokio::test]
async fn test_truncated_response_body_errors() {
    let (upstream, _heads) = common::spawn_raw_upstream(
        b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc",
        true,
    )
    .await;
    let builder = common::default_builder();
    let proxy = builder.build("default", &target(upstream), false, false).unwrap();

    let response = proxy.serve(Request::get("/").body(Empty::<Bytes>::new()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.into_body().collect().await.is_err());
}

#[tokio::test]
async fn test_head_response_has_no_body() {
    let (upstream, _heads) = common::spawn_raw_upstream(
        b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n",
        false,
    )
    .await;
    let builder = common::default_builder();
    let proxy = builder.build("default", &target(upstream), false, false).unwrap();

    let response = proxy.serve(Request::head("/").body(Empty::<Bytes>::new()).unwrap()).await;
    assert_eq!(response.headers()["content-length"], "1234");
    assert_eq!(body_text(response).await, "");
    assert!(common::eventually(|| proxy.pool().stats().idle == 1).await);
}

#[tokio::test]
async fn test_interim_responses_are_skipped() {
    let (upstream, _heads) = common::spawn_raw_upstream(
        b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 4\r\n\r\ndone",
        false,
    )
    .await;
    let builder = common::default_builder();
    let proxy = builder.build("default", &target(upstream), false, false).unwrap();

    let response = proxy
        .serve(Request::post("/").body(Full::new(Bytes::from_static(b"x"))).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_text(response).await, "done");
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let builder = common::default_builder();
    let proxy = builder.build("default", &target(addr), false, false).unwrap();
    let response = proxy.serve(Request::get("/").body(Empty::<Bytes>::new()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_text(response).await, "Bad Gateway");
}

#[tokio::test]
async fn test_cancel_before_response_is_client_closed_request() {
    let upstream = common::spawn_silent_upstream().await;
    let builder = common::default_builder();
    let proxy = builder.build("default", &target(upstream), false, false).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let req = Request::get("/slow").body(Empty::<Bytes>::new()).unwrap();
    let response = proxy.serve_with_cancel(req, cancel).await;
    assert_eq!(response.status().as_u16(), 499);
    assert_eq!(body_text(response).await, "Client Closed Request");
}

#[tokio::test]
async fn test_response_header_timeout_is_gateway_timeout() {
    let upstream = common::spawn_silent_upstream().await;
    let settings = TransportSettings {
        response_header_timeout_secs: 1,
        ..TransportSettings::default()
    };
    let builder = common::builder_with(settings);
    let proxy = builder.build("default", &target(upstream), false, false).unwrap();

    let response = proxy.serve(Request::get("/").body(Empty::<Bytes>::new()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

/// Connection whose every write fails before a byte is accepted.
struct RefusingIo;

impl AsyncRead for RefusingIo {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for RefusingIo {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "stale connection")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// First `failures` dials hand out [`RefusingIo`], later ones reach `addr`.
fn flaky_proxy(addr: SocketAddr, failures: usize) -> (ReverseProxy, Arc<AtomicUsize>) {
    let dials = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dials);
    let dial: DialFn = Arc::new(move || -> DialFuture {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if n < failures {
                return Ok(Box::new(RefusingIo) as BoxedIo);
            }
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| ProxyError::dial(addr.to_string(), e))?;
            Ok(Box::new(stream) as BoxedIo)
        })
    });
    let pool = Arc::new(ConnectionPool::new(addr.to_string(), dial, 4, Duration::from_secs(90)));
    let rewrite = RewriteOptions {
        target: target(addr),
        pass_host_header: false,
        preserve_path: false,
        debug: false,
        disable_upgrade: false,
        proxy_authorization: None,
    };
    (ReverseProxy::new(pool, rewrite), dials)
}

#[tokio::test]
async fn test_get_is_replayed_after_unsent_write() {
    let upstream = common::spawn_echo_upstream().await;
    let (proxy, dials) = flaky_proxy(upstream, 2);

    let response = proxy.serve(Request::get("/").body(Empty::<Bytes>::new()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(dials.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_post_is_not_replayed() {
    let upstream = common::spawn_echo_upstream().await;
    let (proxy, dials) = flaky_proxy(upstream, 1);

    let req = Request::post("/").body(Full::new(Bytes::from_static(b"data"))).unwrap();
    let response = proxy.serve(req).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(dials.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_idempotency_key_allows_replay() {
    let upstream = common::spawn_echo_upstream().await;
    let (proxy, dials) = flaky_proxy(upstream, 1);

    let req = Request::post("/")
        .header("idempotency-key", "order-42")
        .body(Full::new(Bytes::from_static(b"data")))
        .unwrap();
    let response = proxy.serve(req).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.ends_with("\ndata"));
    assert_eq!(dials.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_replays_are_capped() {
    let upstream = common::spawn_echo_upstream().await;
    let (proxy, dials) = flaky_proxy(upstream, 10);
    let proxy = proxy.with_max_replays(2);

    let response = proxy.serve(Request::get("/").body(Empty::<Bytes>::new()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(dials.load(Ordering::SeqCst), 3);
}
