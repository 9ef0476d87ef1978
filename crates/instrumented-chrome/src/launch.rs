//! Chrome discovery and process launch.

use std::env;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use which::which;

use crate::config::ChromeConfig;
use crate::error::{InstrumentError, InstrumentErrorKind};

/// Locate a Chrome/Chromium executable: `SITEHOUND_CHROME` first, then
/// `$PATH`, then well-known install locations.
pub fn detect_chrome_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("SITEHOUND_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in chrome_executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    os_specific_chrome_paths()
        .into_iter()
        .find(|candidate| candidate.exists())
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(any(target_os = "macos", target_os = "linux", target_os = "freebsd"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        &["chrome"]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "freebsd")))]
    {
        Vec::new()
    }
}

/// A launched browser process and its DevTools endpoint.
pub struct ChromeProcess {
    child: Option<Child>,
    ws_url: String,
    debug_port: u16,
}

impl ChromeProcess {
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn debug_port(&self) -> u16 {
        self.debug_port
    }

    /// Kill the browser; safe to call repeatedly.
    pub async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill().await {
                warn!(target: "instrumented-chrome", %err, "failed to kill browser process");
            }
        }
    }
}

impl Drop for ChromeProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Launch Chrome with remote debugging enabled and resolve the page
/// WebSocket endpoint. When `cfg.websocket_url` is set, no process is
/// spawned and the given endpoint is used as-is.
pub async fn launch(cfg: &ChromeConfig) -> Result<ChromeProcess, InstrumentError> {
    if let Some(ws_url) = &cfg.websocket_url {
        return Ok(ChromeProcess {
            child: None,
            ws_url: ws_url.clone(),
            debug_port: 0,
        });
    }

    let executable = if cfg.executable.as_os_str().is_empty() {
        detect_chrome_executable().ok_or_else(|| {
            InstrumentError::new(InstrumentErrorKind::Launch)
                .with_hint("no chrome executable found; set SITEHOUND_CHROME")
        })?
    } else if cfg.executable.exists() {
        cfg.executable.clone()
    } else {
        return Err(InstrumentError::new(InstrumentErrorKind::Launch).with_hint(format!(
            "chrome executable not found at {}",
            cfg.executable.display()
        )));
    };

    let debug_port = free_port()?;

    std::fs::create_dir_all(&cfg.user_data_dir).map_err(|err| {
        InstrumentError::new(InstrumentErrorKind::Launch)
            .with_hint(format!("failed to create user-data-dir: {err}"))
    })?;

    let mut command = Command::new(&executable);
    command
        .arg(format!("--remote-debugging-port={debug_port}"))
        .arg(format!("--user-data-dir={}", cfg.user_data_dir.display()))
        .args([
            "--disable-background-networking",
            "--disable-background-timer-throttling",
            "--disable-breakpad",
            "--disable-client-side-phishing-detection",
            "--disable-component-update",
            "--disable-default-apps",
            "--disable-dev-shm-usage",
            "--disable-extensions",
            "--disable-hang-monitor",
            "--disable-popup-blocking",
            "--disable-prompt-on-repost",
            "--disable-sync",
            "--metrics-recording-only",
            "--no-first-run",
            "--no-default-browser-check",
            "--password-store=basic",
            "--remote-allow-origins=*",
            "--use-mock-keychain",
        ]);

    if cfg.headless {
        command.args(["--headless=new", "--hide-scrollbars", "--mute-audio"]);
    }
    if env::var("SITEHOUND_DISABLE_SANDBOX")
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
    {
        command.arg("--no-sandbox");
    }
    if let Some(proxy) = &cfg.proxy_server {
        // Route every page request through the capture proxy; bypass nothing,
        // the scanner wants loopback targets proxied too.
        command.arg(format!("--proxy-server={proxy}"));
        command.arg("--proxy-bypass-list=<-loopback>");
    }
    command.arg("about:blank");

    command
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|err| {
        InstrumentError::new(InstrumentErrorKind::Launch)
            .with_hint(format!("failed to spawn {}: {err}", executable.display()))
    })?;

    let ws_url = wait_for_ws_url(debug_port, &mut child).await?;
    info!(target: "instrumented-chrome", port = debug_port, url = %ws_url, "browser launched");

    Ok(ChromeProcess {
        child: Some(child),
        ws_url,
        debug_port,
    })
}

fn free_port() -> Result<u16, InstrumentError> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(|err| {
        InstrumentError::new(InstrumentErrorKind::Launch)
            .with_hint(format!("failed to reserve debug port: {err}"))
    })?;
    let port = listener
        .local_addr()
        .map_err(|err| {
            InstrumentError::new(InstrumentErrorKind::Launch)
                .with_hint(format!("failed to read reserved port: {err}"))
        })?
        .port();
    drop(listener);
    Ok(port)
}

/// Poll the DevTools `/json` endpoint for the first page target, watching
/// for early process death.
async fn wait_for_ws_url(port: u16, child: &mut Child) -> Result<String, InstrumentError> {
    let endpoint = format!("http://127.0.0.1:{port}/json");

    for _ in 0..100 {
        sleep(Duration::from_millis(100)).await;

        if let Some(status) = child.try_wait().map_err(|err| {
            InstrumentError::new(InstrumentErrorKind::Launch)
                .with_hint(format!("failed to poll browser process: {err}"))
        })? {
            return Err(InstrumentError::new(InstrumentErrorKind::Launch)
                .with_hint(format!("browser exited during startup with {status}")));
        }

        let Ok(response) = reqwest::get(&endpoint).await else {
            continue;
        };
        let Ok(targets) = response.json::<Vec<Value>>().await else {
            continue;
        };
        let page_ws = targets.iter().find_map(|target| {
            (target["type"] == "page")
                .then(|| target["webSocketDebuggerUrl"].as_str())
                .flatten()
        });
        if let Some(ws_url) = page_ws {
            return Ok(ws_url.to_string());
        }
        debug!(target: "instrumented-chrome", port, "devtools endpoint up, no page target yet");
    }

    Err(InstrumentError::new(InstrumentErrorKind::Launch)
        .with_hint(format!("no devtools page endpoint on port {port} after 10s")))
}
