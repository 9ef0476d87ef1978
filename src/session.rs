//! Crawl-session wiring: capture proxy + instrumented browser + queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use capture_proxy::{
    CaptureProxy, CaptureQueue, CapturingHandler, ProxyConfig, ProxyHandle, TcpOpener,
};
use instrumented_chrome::{ChromeConfig, InstrumentedChrome};
use scan_types::SessionId;
use tracing::info;

use crate::CrawlerError;

/// Configuration for one crawl session.
#[derive(Clone, Debug)]
pub struct CrawlerConfig {
    pub chrome: ChromeConfig,
    pub proxy: ProxyConfig,
    /// Capacity of the capture queue shared with the scanning pipeline.
    pub queue_capacity: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            chrome: ChromeConfig::default(),
            proxy: ProxyConfig::default(),
            queue_capacity: 1024,
        }
    }
}

/// One scanning session: a proxied browser and the queue its traffic lands
/// in. The session owns both exclusively; concurrent use of the browser from
/// multiple callers is not supported.
pub struct CrawlerSession {
    browser: InstrumentedChrome,
    proxy: Option<ProxyHandle>,
    queue: CaptureQueue,
}

impl CrawlerSession {
    /// Boot the capture proxy, then launch the browser with all page traffic
    /// routed through it.
    pub async fn launch(cfg: CrawlerConfig) -> Result<Self, CrawlerError> {
        let (publisher, queue) = CaptureQueue::bounded(cfg.queue_capacity);
        let handler = Arc::new(CapturingHandler::new(
            Arc::new(TcpOpener),
            publisher,
            Duration::from_millis(cfg.proxy.publish_timeout_ms),
        ));

        let proxy = CaptureProxy::bind(&cfg.proxy, handler).await?.spawn();

        let mut chrome_cfg = cfg.chrome;
        chrome_cfg.proxy_server = Some(proxy.addr().to_string());

        let browser = match InstrumentedChrome::launch(chrome_cfg).await {
            Ok(browser) => browser,
            Err(err) => {
                proxy.shutdown().await;
                return Err(err.into());
            }
        };

        info!(
            target: "sitehound",
            session = %browser.session(),
            proxy = %proxy.addr(),
            "crawl session started"
        );

        Ok(Self {
            browser,
            proxy: Some(proxy),
            queue,
        })
    }

    /// The instrumented browser surface.
    pub fn browser(&self) -> &InstrumentedChrome {
        &self.browser
    }

    /// The capture queue carrying this session's observed traffic.
    pub fn queue(&self) -> &CaptureQueue {
        &self.queue
    }

    pub fn session_id(&self) -> &SessionId {
        self.browser.session()
    }

    /// Address of the running capture proxy.
    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        self.proxy.as_ref().map(ProxyHandle::addr)
    }

    /// Tear down browser and proxy and clear the queue for the next
    /// session. Idempotent.
    pub async fn terminate(&mut self) {
        self.browser.terminate().await;
        if let Some(proxy) = self.proxy.take() {
            proxy.shutdown().await;
        }
        self.queue.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_ephemeral_proxy_port() {
        let cfg = CrawlerConfig::default();
        assert_eq!(cfg.proxy.listen_addr.port(), 0);
        assert!(cfg.queue_capacity > 0);
    }
}
