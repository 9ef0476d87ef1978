//! End-to-end proxy tests against an in-process target server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use capture_proxy::{
    CaptureProxy, CapturePublisher, CaptureQueue, CapturingHandler, ExchangeHandler,
    ForwardHandler, ProxyConfig, ProxyHandle, TcpOpener,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Minimal HTTP target: answers every request with `served <path>` and keeps
/// the connection open for the next request.
async fn spawn_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind target");
    let addr = listener.local_addr().expect("target addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                loop {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        let Ok(n) = stream.read(&mut chunk).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let head = String::from_utf8_lossy(&buf);
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let body = format!("served {path}");
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    addr
}

async fn spawn_proxy(handler: Arc<dyn ExchangeHandler>) -> ProxyHandle {
    CaptureProxy::bind(&ProxyConfig::default(), handler)
        .await
        .expect("bind proxy")
        .spawn()
}

fn capturing_proxy_parts(capacity: usize) -> (Arc<CapturingHandler>, CaptureQueue) {
    let (publisher, queue) = CaptureQueue::bounded(capacity);
    let handler = capturing_handler(publisher);
    (handler, queue)
}

fn capturing_handler(publisher: CapturePublisher) -> Arc<CapturingHandler> {
    Arc::new(CapturingHandler::new(
        Arc::new(TcpOpener),
        publisher,
        Duration::from_millis(50),
    ))
}

/// Send one absolute-form request through the proxy and read until EOF.
async fn proxied_get(proxy: SocketAddr, target: SocketAddr, path: &str) -> Vec<u8> {
    let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
    let request = format!(
        "GET http://{target}{path} HTTP/1.1\r\nHost: {target}\r\nConnection: close\r\n\r\n"
    );
    client
        .write_all(request.as_bytes())
        .await
        .expect("write request");

    let mut response = Vec::new();
    client
        .read_to_end(&mut response)
        .await
        .expect("read response");
    response
}

#[tokio::test]
async fn forwards_and_captures_one_exchange() {
    let target = spawn_target().await;
    let (handler, queue) = capturing_proxy_parts(16);
    let proxy = spawn_proxy(handler).await;

    let wire = proxied_get(proxy.addr(), target, "/index.html").await;
    let text = String::from_utf8_lossy(&wire);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with("served /index.html"));

    let exchange = queue.recv().await.expect("captured exchange");
    assert_eq!(exchange.request.method, "GET");
    assert_eq!(exchange.request.path(), "/index.html");
    assert_eq!(exchange.response.status, 200);
    // What the client received is exactly what was captured.
    assert_eq!(exchange.response.to_bytes(), wire);

    proxy.shutdown().await;
}

#[tokio::test]
async fn concurrent_connections_capture_every_exchange() {
    let target = spawn_target().await;
    let (handler, queue) = capturing_proxy_parts(64);
    let proxy = spawn_proxy(handler).await;
    let proxy_addr = proxy.addr();

    const CONNECTIONS: usize = 8;
    let mut tasks = Vec::new();
    for i in 0..CONNECTIONS {
        tasks.push(tokio::spawn(async move {
            let path = format!("/page-{i}");
            let wire = proxied_get(proxy_addr, target, &path).await;
            (path, wire)
        }));
    }

    let mut expected = Vec::new();
    for task in tasks {
        expected.push(task.await.expect("client task"));
    }

    let mut captured = Vec::new();
    for _ in 0..CONNECTIONS {
        captured.push(queue.recv().await.expect("captured exchange"));
    }
    assert!(queue.try_drain().await.is_empty(), "no duplicate captures");

    // No cross-connection order guarantee; match by path.
    for (path, wire) in expected {
        let exchange = captured
            .iter()
            .find(|e| e.request.path() == path)
            .unwrap_or_else(|| panic!("no capture for {path}"));
        assert_eq!(exchange.response.to_bytes(), wire);
    }

    proxy.shutdown().await;
}

#[tokio::test]
async fn keep_alive_connection_preserves_request_order() {
    let target = spawn_target().await;
    let (handler, queue) = capturing_proxy_parts(16);
    let proxy = spawn_proxy(handler).await;

    let mut client = TcpStream::connect(proxy.addr()).await.expect("connect proxy");
    for path in ["/first", "/second"] {
        let request =
            format!("GET http://{target}{path} HTTP/1.1\r\nHost: {target}\r\n\r\n");
        client
            .write_all(request.as_bytes())
            .await
            .expect("write request");

        let expected_body = format!("served {path}");
        let mut received = Vec::new();
        let mut chunk = [0u8; 512];
        while !String::from_utf8_lossy(&received).contains(&expected_body) {
            let n = client.read(&mut chunk).await.expect("read response");
            assert!(n > 0, "connection closed before full response");
            received.extend_from_slice(&chunk[..n]);
        }
        let text = String::from_utf8_lossy(&received);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
    }
    drop(client);

    assert_eq!(queue.recv().await.expect("first").request.path(), "/first");
    assert_eq!(queue.recv().await.expect("second").request.path(), "/second");

    proxy.shutdown().await;
}

#[tokio::test]
async fn stalled_consumer_never_blocks_forwarding() {
    let target = spawn_target().await;
    // Capacity one and nobody draining: captures beyond the first are dropped
    // after the bounded publish wait.
    let (handler, _queue) = capturing_proxy_parts(1);
    let proxy = spawn_proxy(handler).await;

    let start = Instant::now();
    for i in 0..3 {
        let wire = proxied_get(proxy.addr(), target, &format!("/stall-{i}")).await;
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.ends_with(&format!("served /stall-{i}")));
    }
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "forwarding stalled behind the capture queue"
    );

    proxy.shutdown().await;
}

#[tokio::test]
async fn upstream_failure_becomes_gateway_error_and_is_not_captured() {
    // Allocate a port with no listener behind it.
    let dead = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let dead_addr = dead.local_addr().expect("addr");
    drop(dead);

    let (handler, queue) = capturing_proxy_parts(16);
    let proxy = spawn_proxy(handler).await;

    let wire = proxied_get(proxy.addr(), dead_addr, "/missing").await;
    let text = String::from_utf8_lossy(&wire);
    assert!(text.starts_with("HTTP/1.1 502 Bad Gateway"));

    assert!(queue.try_drain().await.is_empty());

    proxy.shutdown().await;
}

#[tokio::test]
async fn forward_handler_proxies_without_capturing() {
    let target = spawn_target().await;
    let handler = Arc::new(ForwardHandler::new(Arc::new(TcpOpener)));
    let proxy = spawn_proxy(handler).await;

    let wire = proxied_get(proxy.addr(), target, "/plain").await;
    let text = String::from_utf8_lossy(&wire);
    assert!(text.ends_with("served /plain"));

    proxy.shutdown().await;
}
