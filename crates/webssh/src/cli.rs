//! Command-line interface for the `webssh` binary.
//!
//! Every flag can also come from a `WEBSSH_*` environment variable. A JSON
//! config file, when given, supplies the base values and flags override it.
//!
//! ```bash
//! webssh --listen-port 2222 --user admin:secret --ws-listen 127.0.0.1:8080
//! webssh --config gateway.json -vv
//! ```

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use webssh::{CredentialRecord, GatewayConfig, StaticCredentials};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Web-reachable SSH gateway with an embedded SSH daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "webssh", author, version)]
pub struct Cli {
    /// JSON file with gateway settings
    #[arg(long, short = 'c', env = "WEBSSH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address the SSH daemon binds
    #[arg(long, env = "WEBSSH_LISTEN_HOST")]
    pub listen_host: Option<String>,

    /// Port the SSH daemon binds
    #[arg(long, env = "WEBSSH_LISTEN_PORT")]
    pub listen_port: Option<u16>,

    /// Shell for interactive sessions and exec
    #[arg(long, env = "WEBSSH_SHELL")]
    pub shell: Option<String>,

    /// SSH identification string sent to clients
    #[arg(long, env = "WEBSSH_SERVER_VERSION")]
    pub server_version: Option<String>,

    /// Seconds of client silence before a keepalive ping (0 disables)
    #[arg(long, env = "WEBSSH_KEEPALIVE")]
    pub keepalive: Option<u64>,

    /// Pass client `env` requests through to spawned processes
    #[arg(long, env = "WEBSSH_ENV_PASSTHROUGH")]
    pub env_passthrough: bool,

    /// Seed for the host key; the same seed gives the same key
    #[arg(long, env = "WEBSSH_HOST_KEY_SEED", hide_env_values = true)]
    pub host_key_seed: Option<String>,

    /// Working directory for shells and the SFTP subsystem
    #[arg(long, env = "WEBSSH_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Seconds between idle-session sweeps
    #[arg(long, env = "WEBSSH_SWEEP_INTERVAL")]
    pub sweep_interval: Option<u64>,

    /// Seconds of inactivity before a gateway session is evicted
    #[arg(long, env = "WEBSSH_MAX_IDLE")]
    pub max_idle: Option<u64>,

    /// Address for the websocket terminal endpoint
    #[arg(long, env = "WEBSSH_WS_LISTEN")]
    pub ws_listen: Option<String>,

    /// Pre-authentication banner (`{version}` expands to the server version)
    #[arg(long, env = "WEBSSH_BANNER")]
    pub banner: Option<String>,

    /// Daemon user as `name:secret` or `name:secret:RFC3339-expiry` (repeatable)
    #[arg(long = "user", short = 'u', value_name = "SPEC")]
    pub users: Vec<String>,

    /// OpenSSH authorized_keys file for public key auth
    #[arg(long, env = "WEBSSH_AUTHORIZED_KEYS")]
    pub authorized_keys: Option<PathBuf>,

    /// Increase log verbosity
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "WEBSSH_LOG_FORMAT")]
    pub log_format: LogFormat,
}

impl Cli {
    /// Loads the config file, if any, and applies flag overrides.
    pub fn gateway_config(&self) -> anyhow::Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => GatewayConfig::default(),
        };

        if let Some(host) = &self.listen_host {
            config.listen_host.clone_from(host);
        }
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
        if let Some(shell) = &self.shell {
            config.shell.clone_from(shell);
        }
        if let Some(version) = &self.server_version {
            config.server_version.clone_from(version);
        }
        if let Some(secs) = self.keepalive {
            config.keepalive_interval_secs = secs;
        }
        if self.env_passthrough {
            config.env_passthrough = true;
        }
        if let Some(seed) = &self.host_key_seed {
            config.host_key_seed.clone_from(seed);
        }
        if self.work_dir.is_some() {
            config.work_dir.clone_from(&self.work_dir);
        }
        if let Some(secs) = self.sweep_interval {
            config.sweep_interval_secs = secs;
        }
        if let Some(secs) = self.max_idle {
            config.max_idle_secs = secs;
        }
        if self.ws_listen.is_some() {
            config.ws_listen.clone_from(&self.ws_listen);
        }
        if self.banner.is_some() {
            config.banner.clone_from(&self.banner);
        }
        Ok(config)
    }

    /// Builds the daemon's credential set from `--user` and `--authorized-keys`.
    pub fn credentials(&self) -> anyhow::Result<StaticCredentials> {
        let mut credentials = StaticCredentials::new();
        for spec in &self.users {
            credentials = credentials.with_record(parse_user(spec)?);
        }
        if let Some(path) = &self.authorized_keys {
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading authorized keys {}", path.display()))?;
            credentials = credentials.with_authorized_keys(&content);
        }
        Ok(credentials)
    }

    /// The `tracing` filter implied by `-v` when `RUST_LOG` is unset.
    pub fn default_filter(&self) -> &'static str {
        match self.verbose {
            0 => "webssh=info,warn",
            1 => "webssh=debug,info",
            _ => "trace",
        }
    }
}

fn parse_user(spec: &str) -> anyhow::Result<CredentialRecord> {
    let mut parts = spec.splitn(3, ':');
    let name = parts.next().unwrap_or_default();
    let Some(secret) = parts.next() else {
        bail!("user {name:?} is missing a secret (expected name:secret)");
    };
    if name.is_empty() {
        bail!("user spec {spec:?} has an empty name");
    }

    let record = CredentialRecord::new(name, secret);
    match parts.next() {
        Some(expiry) => {
            let at: DateTime<Utc> = DateTime::parse_from_rfc3339(expiry)
                .with_context(|| format!("user {name:?} has an invalid expiry {expiry:?}"))?
                .with_timezone(&Utc);
            Ok(record.expires_at(at))
        }
        None => Ok(record),
    }
}
