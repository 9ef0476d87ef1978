use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ChannelError, ChannelEvent, ControlChannel};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Responder = oneshot::Sender<Result<Value, ChannelError>>;
type SubscriberMap = DashMap<String, Vec<mpsc::UnboundedSender<ChannelEvent>>>;

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Capacity of the caller -> loop command queue.
    pub command_buffer: usize,
    /// Deadline applied when the caller does not pass one explicitly.
    pub default_deadline_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_buffer: 128,
            default_deadline_ms: 30_000,
        }
    }
}

struct ControlMessage {
    method: String,
    params: Value,
    responder: Responder,
}

/// WebSocket-backed [`ControlChannel`] implementation.
pub struct CdpChannel {
    cfg: ChannelConfig,
    command_tx: mpsc::Sender<ControlMessage>,
    subscribers: Arc<SubscriberMap>,
    alive: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl CdpChannel {
    /// Connect to a DevTools WebSocket endpoint and start the loop task.
    pub async fn connect(ws_url: &str, cfg: ChannelConfig) -> Result<Self, ChannelError> {
        let (stream, _) = connect_async(ws_url)
            .await
            .map_err(|err| ChannelError::Io(err.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(cfg.command_buffer.max(1));
        let subscribers: Arc<SubscriberMap> = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        let loop_subscribers = Arc::clone(&subscribers);
        let loop_alive = Arc::clone(&alive);
        let loop_token = shutdown.clone();
        tokio::spawn(async move {
            run_loop(stream, command_rx, loop_subscribers, loop_token).await;
            loop_alive.store(false, Ordering::Relaxed);
        });

        debug!(target: "cdp-channel", url = %ws_url, "devtools connection established");

        Ok(Self {
            cfg,
            command_tx,
            subscribers,
            alive,
            shutdown,
        })
    }

    /// Default deadline from the channel configuration.
    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.cfg.default_deadline_ms)
    }
}

#[async_trait]
impl ControlChannel for CdpChannel {
    async fn send(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, ChannelError> {
        if !self.is_alive() {
            return Err(ChannelError::ConnectionClosed);
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        let message = ControlMessage {
            method: method.to_string(),
            params,
            responder: resp_tx,
        };

        self.command_tx
            .send(message)
            .await
            .map_err(|_| ChannelError::ConnectionClosed)?;

        match tokio::time::timeout(deadline, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::ConnectionClosed),
            Err(_) => Err(ChannelError::Timeout(deadline)),
        }
    }

    fn subscribe(&self, method: &str) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::Relaxed);
        self.shutdown.cancel();
    }
}

impl Drop for CdpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read/write loop: multiplexes caller commands onto the socket, correlates
/// responses back to waiting callers by id, and routes notifications to
/// subscribers. Exits on shutdown or connection loss, failing every pending
/// command with [`ChannelError::ConnectionClosed`].
async fn run_loop(
    stream: WsStream,
    mut command_rx: mpsc::Receiver<ControlMessage>,
    subscribers: Arc<SubscriberMap>,
    shutdown: CancellationToken,
) {
    let (mut sink, mut source) = stream.split();
    let mut inflight: HashMap<u64, Responder> = HashMap::new();
    let mut next_id: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                break;
            }
            command = command_rx.recv() => {
                let Some(command) = command else { break };
                next_id += 1;
                let frame = json!({
                    "id": next_id,
                    "method": command.method,
                    "params": command.params,
                });
                inflight.insert(next_id, command.responder);
                if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                    warn!(target: "cdp-channel", "socket write failed");
                    break;
                }
            }
            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(text.as_str(), &mut inflight, &subscribers);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Ok(_)) => {
                        // ping/pong/binary: nothing to correlate
                    }
                    Some(Err(err)) => {
                        warn!(target: "cdp-channel", %err, "socket read failed");
                        break;
                    }
                }
            }
        }
    }

    for (_, responder) in inflight.drain() {
        let _ = responder.send(Err(ChannelError::ConnectionClosed));
    }
    debug!(target: "cdp-channel", "channel loop exited");
}

fn handle_frame(text: &str, inflight: &mut HashMap<u64, Responder>, subscribers: &SubscriberMap) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(target: "cdp-channel", %err, "discarding unparseable frame");
            return;
        }
    };

    if let Some(id) = frame.get("id").and_then(Value::as_u64) {
        let Some(responder) = inflight.remove(&id) else {
            debug!(target: "cdp-channel", id, "response without a waiting caller");
            return;
        };
        let result = match frame.get("error") {
            Some(error) => {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified protocol error");
                Err(ChannelError::Protocol(message.to_string()))
            }
            None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = responder.send(result);
        return;
    }

    if let Some(method) = frame.get("method").and_then(Value::as_str) {
        let event = ChannelEvent {
            method: method.to_string(),
            params: frame.get("params").cloned().unwrap_or(Value::Null),
        };
        if let Some(mut entry) = subscribers.get_mut(method) {
            entry.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}
