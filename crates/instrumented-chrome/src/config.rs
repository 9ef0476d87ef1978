use std::env;
use std::path::{Path, PathBuf};

use crate::launch::detect_chrome_executable;

/// Configuration for launching and tuning an instrumented browser session.
#[derive(Clone, Debug)]
pub struct ChromeConfig {
    pub executable: PathBuf,
    pub user_data_dir: PathBuf,
    pub headless: bool,
    /// `host:port` of the traffic-capturing proxy all page traffic is routed
    /// through; `None` launches without a proxy.
    pub proxy_server: Option<String>,
    /// Deadline applied to individual remote-control commands.
    pub command_deadline_ms: u64,
    /// Default bound for `wait_for_load`.
    pub load_timeout_ms: u64,
    /// Attach to an already-running browser instead of launching one.
    pub websocket_url: Option<String>,
}

impl Default for ChromeConfig {
    fn default() -> Self {
        Self {
            executable: detect_chrome_executable().unwrap_or_default(),
            user_data_dir: default_profile_dir(),
            headless: resolve_headless_default(),
            proxy_server: None,
            command_deadline_ms: 30_000,
            load_timeout_ms: 30_000,
            websocket_url: None,
        }
    }
}

fn resolve_headless_default() -> bool {
    // SITEHOUND_HEADLESS: "0", "false", "no", "off" means headful.
    match env::var("SITEHOUND_HEADLESS") {
        Ok(value) => {
            let lower = value.to_ascii_lowercase();
            !matches!(lower.as_str(), "0" | "false" | "no" | "off")
        }
        Err(_) => true,
    }
}

fn default_profile_dir() -> PathBuf {
    if let Ok(path) = env::var("SITEHOUND_CHROME_PROFILE") {
        return PathBuf::from(path);
    }
    Path::new("./.sitehound-profile").into()
}
