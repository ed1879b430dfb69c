//! Gateway configuration values.
//!
//! The struct deserializes from any serde format so an outer layer can load
//! it from a file; this crate only consumes the values.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Settings for the embedded daemon and the session registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Daemon bind host.
    pub listen_host: String,
    /// Daemon bind port.
    pub listen_port: u16,
    /// Shell started for `shell` and `exec` requests.
    pub shell: String,
    /// SSH identification string sent by the daemon.
    pub server_version: String,
    /// Seconds of client silence before a keepalive ping. Zero disables it.
    pub keepalive_interval_secs: u64,
    /// Whether `env` requests reach spawned processes.
    pub env_passthrough: bool,
    /// Seed for the daemon host key. Empty means a random key.
    pub host_key_seed: String,
    /// Working directory for spawned processes and the SFTP root.
    pub work_dir: Option<PathBuf>,
    /// Seconds between registry sweeps.
    pub sweep_interval_secs: u64,
    /// Seconds of inactivity before a bridge session is evicted.
    pub max_idle_secs: u64,
    /// Websocket endpoint bind address, if any.
    pub ws_listen: Option<String>,
    /// Pre-auth banner shown by the daemon.
    pub banner: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 2222,
            shell: "/bin/sh".to_string(),
            server_version: "SSH-2.0-WebSSH".to_string(),
            keepalive_interval_secs: 0,
            env_passthrough: false,
            host_key_seed: String::new(),
            work_dir: None,
            sweep_interval_secs: 15,
            max_idle_secs: 60,
            ws_listen: None,
            banner: None,
        }
    }
}

impl GatewayConfig {
    /// `host:port` for the daemon listener.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    /// Keepalive interval, or `None` when disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}
