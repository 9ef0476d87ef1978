//! The instrumented browser controller.
//!
//! One controller owns one browser session and its remote-control channel
//! exclusively. Navigation is fire-and-forget (`load_url` does not wait);
//! callers bound the wait themselves with `wait_for_load`. Event dispatch
//! confirms submission into the page's event queue and never waits for
//! handlers — callers that need post-handler state poll `get_dom` after an
//! application-appropriate delay.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cdp_channel::{CdpChannel, ChannelConfig, ChannelEvent, ControlChannel};
use parking_lot::Mutex;
use scan_types::{
    ConsoleMessage, DomSnapshot, EventListenerDescriptor, JsError, SessionId, DOCUMENT_NODE_TYPE,
    ELEMENT_NODE_TYPE, PSEUDO_DOCUMENT, PSEUDO_WINDOW, WINDOW_NODE_TYPE,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ChromeConfig;
use crate::dom::{
    console_message_from_params, dispatch_expression, js_error_from_params,
    ALL_ELEMENTS_EXPRESSION, DOM_EXPRESSION, LISTENER_OBJECT_GROUP, NODE_IDENTITY_FN,
};
use crate::error::{InstrumentError, InstrumentErrorKind};
use crate::launch::{self, ChromeProcess};

const ENABLED_DOMAINS: [&str; 3] = ["Page.enable", "Runtime.enable", "DOM.enable"];

/// A driven browser session.
pub struct InstrumentedChrome {
    session: SessionId,
    channel: Arc<dyn ControlChannel>,
    process: AsyncMutex<Option<ChromeProcess>>,
    console_buf: Arc<Mutex<Vec<ConsoleMessage>>>,
    error_buf: Arc<Mutex<Vec<JsError>>>,
    load_seq: watch::Receiver<u64>,
    nav_baseline: AtomicU64,
    terminated: AtomicBool,
    pump: CancellationToken,
    command_deadline: Duration,
    load_timeout: Duration,
}

impl InstrumentedChrome {
    /// Launch a browser per `cfg` and attach the controller to it.
    pub async fn launch(cfg: ChromeConfig) -> Result<Self, InstrumentError> {
        let process = launch::launch(&cfg).await?;
        let channel = CdpChannel::connect(
            process.ws_url(),
            ChannelConfig {
                default_deadline_ms: cfg.command_deadline_ms,
                ..ChannelConfig::default()
            },
        )
        .await?;

        Self::with_channel(Arc::new(channel), Some(process), &cfg).await
    }

    /// Attach the controller to an existing channel. Used by `launch` and by
    /// tests driving a scripted channel.
    pub async fn with_channel(
        channel: Arc<dyn ControlChannel>,
        process: Option<ChromeProcess>,
        cfg: &ChromeConfig,
    ) -> Result<Self, InstrumentError> {
        let console_rx = channel.subscribe("Runtime.consoleAPICalled");
        let error_rx = channel.subscribe("Runtime.exceptionThrown");
        let load_rx = channel.subscribe("Page.loadEventFired");

        let console_buf = Arc::new(Mutex::new(Vec::new()));
        let error_buf = Arc::new(Mutex::new(Vec::new()));
        let (load_tx, load_seq) = watch::channel(0u64);
        let pump = CancellationToken::new();

        spawn_event_pump(
            pump.clone(),
            console_rx,
            error_rx,
            load_rx,
            Arc::clone(&console_buf),
            Arc::clone(&error_buf),
            load_tx,
        );

        let command_deadline = Duration::from_millis(cfg.command_deadline_ms);
        for method in ENABLED_DOMAINS {
            channel.send(method, json!({}), command_deadline).await?;
        }

        let session = SessionId::new();
        debug!(target: "instrumented-chrome", %session, "controller attached");

        Ok(Self {
            session,
            channel,
            process: AsyncMutex::new(process),
            console_buf,
            error_buf,
            load_seq,
            nav_baseline: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
            pump,
            command_deadline,
            load_timeout: Duration::from_millis(cfg.load_timeout_ms),
        })
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Issue a navigation command. Does not wait for completion.
    pub async fn load_url(&self, url: &str) -> Result<(), InstrumentError> {
        self.ensure_active()?;
        self.nav_baseline
            .store(*self.load_seq.borrow(), Ordering::Relaxed);
        self.channel
            .send("Page.navigate", json!({ "url": url }), self.command_deadline)
            .await?;
        debug!(target: "instrumented-chrome", url, "navigation issued");
        Ok(())
    }

    /// Wait for the load event of the most recent navigation, bounded by the
    /// configured load timeout.
    pub async fn wait_for_load(&self) -> Result<(), InstrumentError> {
        self.wait_for_load_within(self.load_timeout).await
    }

    /// Wait for the load event of the most recent navigation. Pages that
    /// never fire a terminal load event fail with `LoadTimeout`.
    pub async fn wait_for_load_within(&self, timeout: Duration) -> Result<(), InstrumentError> {
        self.ensure_active()?;
        let baseline = self.nav_baseline.load(Ordering::Relaxed);
        let mut seq = self.load_seq.clone();

        let waited = tokio::time::timeout(timeout, async move {
            loop {
                if *seq.borrow() > baseline {
                    return Ok(());
                }
                if seq.changed().await.is_err() {
                    return Err(InstrumentError::new(InstrumentErrorKind::SessionTerminated)
                        .with_hint("event pump stopped"));
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(InstrumentError::new(InstrumentErrorKind::LoadTimeout)
                .with_hint(format!("no load event within {timeout:?}"))),
        }
    }

    /// Serialize the current document.
    pub async fn get_dom(&self) -> Result<DomSnapshot, InstrumentError> {
        self.ensure_active()?;
        let value = self.evaluate(DOM_EXPRESSION).await?;
        Ok(DomSnapshot(value.as_str().unwrap_or_default().to_string()))
    }

    /// Enumerate every registered JS event listener: all element nodes in
    /// document order, then the document and window pseudo-targets.
    ///
    /// The snapshot is regenerated on every call; with no DOM mutation in
    /// between, two calls return identical sequences.
    pub async fn get_js_event_listeners(
        &self,
    ) -> Result<Vec<EventListenerDescriptor>, InstrumentError> {
        self.ensure_active()?;
        let mut descriptors = Vec::new();

        let array = self
            .channel
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": ALL_ELEMENTS_EXPRESSION,
                    "objectGroup": LISTENER_OBJECT_GROUP,
                }),
                self.command_deadline,
            )
            .await?;

        if let Some(array_id) = array["result"]["objectId"].as_str() {
            let properties = self
                .channel
                .send(
                    "Runtime.getProperties",
                    json!({ "objectId": array_id, "ownProperties": true }),
                    self.command_deadline,
                )
                .await?;

            for entry in properties["result"].as_array().into_iter().flatten() {
                if entry["enumerable"].as_bool() != Some(true) {
                    continue;
                }
                if entry["value"]["subtype"].as_str() != Some("node") {
                    continue;
                }
                let Some(object_id) = entry["value"]["objectId"].as_str() else {
                    continue;
                };

                let listeners = self.registered_listeners(object_id).await?;
                if listeners.is_empty() {
                    continue;
                }

                let (selector, tag_name, node_type) = self.node_identity(object_id).await?;
                for (event_type, use_capture) in listeners {
                    descriptors.push(EventListenerDescriptor {
                        selector: selector.clone(),
                        tag_name: tag_name.clone(),
                        node_type,
                        event_type,
                        use_capture,
                    });
                }
            }
        }

        // The document and window are not reachable from the element walk;
        // query them directly and report the reserved pseudo identities.
        self.pseudo_listeners("document", PSEUDO_DOCUMENT, DOCUMENT_NODE_TYPE, &mut descriptors)
            .await?;
        self.pseudo_listeners("window", PSEUDO_WINDOW, WINDOW_NODE_TYPE, &mut descriptors)
            .await?;

        let _ = self
            .channel
            .send(
                "Runtime.releaseObjectGroup",
                json!({ "objectGroup": LISTENER_OBJECT_GROUP }),
                self.command_deadline,
            )
            .await;

        Ok(descriptors)
    }

    /// Resolve `selector` (element, `!document`, or `!window`) and submit a
    /// synthetic event of `event_type` into the page's event queue.
    ///
    /// `Ok(true)` confirms submission only; handlers may still be running —
    /// including arbitrarily slow ones. `Ok(false)` means the selector no
    /// longer resolves to a live target, which is not a fault: selectors can
    /// legitimately go stale between enumeration and dispatch.
    pub async fn dispatch_js_event(
        &self,
        selector: &str,
        event_type: &str,
    ) -> Result<bool, InstrumentError> {
        self.ensure_active()?;
        let value = self
            .evaluate(&dispatch_expression(selector, event_type))
            .await?;
        let submitted = value.as_bool().unwrap_or(false);
        if !submitted {
            debug!(target: "instrumented-chrome", selector, "dispatch target not found");
        }
        Ok(submitted)
    }

    /// Drain buffered console output. A second call returns an empty list
    /// unless new messages arrived in between.
    pub fn get_console_messages(&self) -> Vec<ConsoleMessage> {
        std::mem::take(&mut *self.console_buf.lock())
    }

    /// Drain buffered unhandled script errors. A clean session drains to an
    /// empty list at teardown.
    pub fn get_js_errors(&self) -> Vec<JsError> {
        std::mem::take(&mut *self.error_buf.lock())
    }

    /// Release the browser session and channel. Idempotent; safe to call
    /// after the session already died.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pump.cancel();

        if self.channel.is_alive() {
            let _ = self
                .channel
                .send("Browser.close", json!({}), Duration::from_secs(2))
                .await;
        }
        self.channel.close();

        if let Some(mut process) = self.process.lock().await.take() {
            process.kill().await;
        }
        debug!(target: "instrumented-chrome", session = %self.session, "session terminated");
    }

    fn ensure_active(&self) -> Result<(), InstrumentError> {
        if self.terminated.load(Ordering::Relaxed) {
            return Err(InstrumentError::new(InstrumentErrorKind::SessionTerminated)
                .with_hint("terminate() was called"));
        }
        if !self.channel.is_alive() {
            return Err(InstrumentError::new(InstrumentErrorKind::SessionTerminated)
                .with_hint("browser connection lost"));
        }
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, InstrumentError> {
        let result = self
            .channel
            .send(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true }),
                self.command_deadline,
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let message = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("evaluation failed");
            return Err(InstrumentError::new(InstrumentErrorKind::Protocol).with_hint(message));
        }
        Ok(result["result"]["value"].clone())
    }

    async fn registered_listeners(
        &self,
        object_id: &str,
    ) -> Result<Vec<(String, bool)>, InstrumentError> {
        let result = self
            .channel
            .send(
                "DOMDebugger.getEventListeners",
                json!({ "objectId": object_id }),
                self.command_deadline,
            )
            .await?;

        Ok(result["listeners"]
            .as_array()
            .map(|listeners| {
                listeners
                    .iter()
                    .map(|listener| {
                        (
                            listener["type"].as_str().unwrap_or_default().to_string(),
                            listener["useCapture"].as_bool().unwrap_or(false),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn node_identity(
        &self,
        object_id: &str,
    ) -> Result<(String, String, i32), InstrumentError> {
        let result = self
            .channel
            .send(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": NODE_IDENTITY_FN,
                    "returnByValue": true,
                }),
                self.command_deadline,
            )
            .await?;

        let value = &result["result"]["value"];
        Ok((
            value["selector"].as_str().unwrap_or_default().to_string(),
            value["tagName"].as_str().unwrap_or_default().to_string(),
            value["nodeType"]
                .as_i64()
                .unwrap_or(ELEMENT_NODE_TYPE as i64) as i32,
        ))
    }

    async fn pseudo_listeners(
        &self,
        expression: &str,
        pseudo: &str,
        node_type: i32,
        out: &mut Vec<EventListenerDescriptor>,
    ) -> Result<(), InstrumentError> {
        let target = self
            .channel
            .send(
                "Runtime.evaluate",
                json!({ "expression": expression, "objectGroup": LISTENER_OBJECT_GROUP }),
                self.command_deadline,
            )
            .await?;

        let Some(object_id) = target["result"]["objectId"].as_str() else {
            return Ok(());
        };
        for (event_type, use_capture) in self.registered_listeners(object_id).await? {
            out.push(EventListenerDescriptor {
                selector: pseudo.to_string(),
                tag_name: pseudo.to_string(),
                node_type,
                event_type,
                use_capture,
            });
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_event_pump(
    token: CancellationToken,
    mut console_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    mut error_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    mut load_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    console_buf: Arc<Mutex<Vec<ConsoleMessage>>>,
    error_buf: Arc<Mutex<Vec<JsError>>>,
    load_tx: watch::Sender<u64>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = console_rx.recv() => {
                    let Some(event) = event else { break };
                    console_buf.lock().push(console_message_from_params(&event.params));
                }
                event = error_rx.recv() => {
                    let Some(event) = event else { break };
                    let error = js_error_from_params(&event.params);
                    warn!(target: "instrumented-chrome", message = %error.message, "unhandled script error");
                    error_buf.lock().push(error);
                }
                event = load_rx.recv() => {
                    if event.is_none() { break; }
                    load_tx.send_modify(|seq| *seq += 1);
                }
            }
        }
        debug!(target: "instrumented-chrome", "event pump exited");
    });
}
