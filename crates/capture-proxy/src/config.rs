use std::net::SocketAddr;
use std::path::PathBuf;

/// Construction parameters for the proxy listener.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Address to listen on; port 0 picks an ephemeral port.
    pub listen_addr: SocketAddr,
    /// Upper bound on how long a capture publish may block a connection task
    /// when the queue is full; past it the entry is dropped.
    pub publish_timeout_ms: u64,
    /// CA certificate material for the TLS-interception collaborator.
    /// Carried through construction; this layer tunnels TLS without
    /// intercepting it.
    pub ca_cert_path: Option<PathBuf>,
    pub ca_key_path: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            publish_timeout_ms: 250,
            ca_cert_path: None,
            ca_key_path: None,
        }
    }
}
