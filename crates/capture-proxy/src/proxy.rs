//! Forwarding proxy with a pluggable per-exchange handler.
//!
//! The listener spawns one task per accepted connection. Each task reads
//! requests in order, hands them to the installed [`ExchangeHandler`], and
//! relays the response. The handler decides whether the completed exchange is
//! also published to the capture queue; forwarding behavior is identical
//! either way.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scan_types::{CapturedExchange, HttpRequest, HttpResponse};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::http::MessageReader;
use crate::queue::CapturePublisher;
use crate::ProxyError;

/// Collaborator that performs the actual upstream exchange.
#[async_trait]
pub trait UriOpener: Send + Sync {
    async fn open(&self, request: &HttpRequest) -> Result<HttpResponse, ProxyError>;
}

/// Default opener: dials the request's host directly over TCP.
#[derive(Default)]
pub struct TcpOpener;

#[async_trait]
impl UriOpener for TcpOpener {
    async fn open(&self, request: &HttpRequest) -> Result<HttpResponse, ProxyError> {
        let host = request
            .host()
            .ok_or_else(|| ProxyError::Parse("request without host".to_string()))?;
        let addr = if host.contains(':') {
            host
        } else {
            format!("{host}:80")
        };

        let mut upstream = TcpStream::connect(&addr)
            .await
            .map_err(|err| ProxyError::Upstream(format!("connect {addr}: {err}")))?;
        upstream
            .write_all(&request.to_bytes())
            .await
            .map_err(|err| ProxyError::Upstream(format!("write {addr}: {err}")))?;

        let mut reader = MessageReader::new(upstream);
        reader
            .read_response(request.method.eq_ignore_ascii_case("HEAD"))
            .await
            .map_err(|err| ProxyError::Upstream(format!("read {addr}: {err}")))
    }
}

/// Per-exchange strategy installed at proxy construction.
#[async_trait]
pub trait ExchangeHandler: Send + Sync {
    async fn handle(&self, request: HttpRequest) -> Result<HttpResponse, ProxyError>;
}

/// Forwards and nothing else.
pub struct ForwardHandler {
    opener: Arc<dyn UriOpener>,
}

impl ForwardHandler {
    pub fn new(opener: Arc<dyn UriOpener>) -> Self {
        Self { opener }
    }
}

#[async_trait]
impl ExchangeHandler for ForwardHandler {
    async fn handle(&self, request: HttpRequest) -> Result<HttpResponse, ProxyError> {
        self.opener.open(&request).await
    }
}

/// Forwards, then publishes the completed pair to the capture queue.
///
/// Failed exchanges are not published; the capture side performs no error
/// handling of its own.
pub struct CapturingHandler {
    opener: Arc<dyn UriOpener>,
    queue: CapturePublisher,
    publish_timeout: Duration,
}

impl CapturingHandler {
    pub fn new(
        opener: Arc<dyn UriOpener>,
        queue: CapturePublisher,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            opener,
            queue,
            publish_timeout,
        }
    }
}

#[async_trait]
impl ExchangeHandler for CapturingHandler {
    async fn handle(&self, request: HttpRequest) -> Result<HttpResponse, ProxyError> {
        let response = self.opener.open(&request).await?;

        let exchange = CapturedExchange {
            request,
            response: response.clone(),
        };
        self.queue.publish(exchange, self.publish_timeout).await;

        Ok(response)
    }
}

/// Bound proxy listener, not yet serving.
pub struct CaptureProxy {
    listener: TcpListener,
    handler: Arc<dyn ExchangeHandler>,
    addr: SocketAddr,
}

impl CaptureProxy {
    /// Bind the configured listen address with the given handler strategy.
    pub async fn bind(
        cfg: &ProxyConfig,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(cfg.listen_addr).await?;
        let addr = listener.local_addr()?;
        info!(target: "capture-proxy", %addr, "proxy listening");
        Ok(Self {
            listener,
            handler,
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the accept loop and return a handle for lifecycle control.
    pub fn spawn(self) -> ProxyHandle {
        let cancel = CancellationToken::new();
        let loop_token = cancel.clone();
        let addr = self.addr;
        let handler = self.handler;
        let listener = self.listener;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let handler = Arc::clone(&handler);
                                let conn_token = loop_token.clone();
                                tokio::spawn(async move {
                                    serve_connection(stream, peer, handler, conn_token).await;
                                });
                            }
                            Err(err) => {
                                warn!(target: "capture-proxy", %err, "accept failed");
                            }
                        }
                    }
                }
            }
        });

        ProxyHandle {
            addr,
            cancel,
            task: Some(task),
        }
    }
}

/// Lifecycle handle for a running proxy.
pub struct ProxyHandle {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ProxyHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and wind down connection tasks.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn ExchangeHandler>,
    token: CancellationToken,
) {
    let mut reader = MessageReader::new(stream);

    loop {
        let request = tokio::select! {
            _ = token.cancelled() => break,
            request = reader.read_request() => request,
        };

        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                debug!(target: "capture-proxy", %peer, %err, "dropping unparseable connection");
                break;
            }
        };

        if request.method.eq_ignore_ascii_case("CONNECT") {
            tunnel(reader, &request).await;
            return;
        }

        let client_wants_close = wants_close(&request);

        let response = match handler.handle(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(target: "capture-proxy", %peer, %err, "upstream exchange failed");
                bad_gateway()
            }
        };

        let server_wants_close = response
            .header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(response.version == 0);

        if reader
            .stream_mut()
            .write_all(&response.to_bytes())
            .await
            .is_err()
        {
            break;
        }

        if client_wants_close || server_wants_close {
            break;
        }
    }
}

/// Blind CONNECT tunnel. TLS interception is the certificate collaborator's
/// concern; tunneled bytes are not captured.
async fn tunnel(reader: MessageReader<TcpStream>, request: &HttpRequest) {
    let (mut client, leftover) = reader.into_parts();

    let mut upstream = match TcpStream::connect(&request.target).await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(target: "capture-proxy", target_uri = %request.target, %err, "tunnel connect failed");
            let _ = client.write_all(&bad_gateway().to_bytes()).await;
            return;
        }
    };

    if client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .is_err()
    {
        return;
    }
    if !leftover.is_empty() && upstream.write_all(&leftover).await.is_err() {
        return;
    }

    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
}

fn wants_close(request: &HttpRequest) -> bool {
    match request.header("connection") {
        Some(value) => value.eq_ignore_ascii_case("close"),
        None => request.version == 0,
    }
}

fn bad_gateway() -> HttpResponse {
    HttpResponse {
        version: 1,
        status: 502,
        reason: "Bad Gateway".to_string(),
        headers: vec![
            ("Content-Length".to_string(), "0".to_string()),
            ("Connection".to_string(), "close".to_string()),
        ],
        body: Vec::new(),
    }
}
