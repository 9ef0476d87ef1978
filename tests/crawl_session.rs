//! Full-stack session test: real browser, traffic through the capture
//! proxy, exchanges landing in the queue.
//!
//! Skipped unless `SITEHOUND_USE_REAL_CHROME=1`.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use sitehound::{CrawlerConfig, CrawlerSession};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn should_run_real_tests() -> bool {
    env::var("SITEHOUND_USE_REAL_CHROME")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

const PAGE: &str = r#"<html><body>
<button id="go">go</button>
<script>
    document.getElementById("go").addEventListener("click", function() {
        document.body.appendChild(document.createElement("hr"));
    }, false);
</script>
</body></html>"#;

async fn spawn_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind target");
    let addr = listener.local_addr().expect("target addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    PAGE.len(),
                    PAGE
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    addr
}

#[tokio::test]
async fn session_captures_browser_traffic() {
    if !should_run_real_tests() {
        println!("Skipping real browser test (SITEHOUND_USE_REAL_CHROME not set)");
        return;
    }
    init_tracing();

    let target = spawn_target().await;
    let profile = tempfile::tempdir().expect("profile dir");

    let mut cfg = CrawlerConfig::default();
    cfg.chrome.user_data_dir = profile.path().into();
    cfg.chrome.headless = true;

    let mut session = CrawlerSession::launch(cfg).await.expect("launch session");

    let url = format!("http://{target}/");
    session.browser().load_url(&url).await.expect("navigate");
    session.browser().wait_for_load().await.expect("page load");

    // The page document itself must have crossed the proxy into the queue.
    let exchange = tokio::time::timeout(Duration::from_secs(10), session.queue().recv())
        .await
        .expect("capture within deadline")
        .expect("captured exchange");
    assert_eq!(exchange.response.status, 200);
    assert!(String::from_utf8_lossy(&exchange.response.body).contains("id=\"go\""));

    // And the controller surface still works through the proxy.
    let dom = session.browser().get_dom().await.expect("dom");
    assert!(dom.contains("go"));

    let listeners = session
        .browser()
        .get_js_event_listeners()
        .await
        .expect("listeners");
    assert!(listeners.iter().any(|l| l.selector == "#go" && l.event_type == "click"));

    assert!(session.browser().get_js_errors().is_empty());
    session.terminate().await;
}
