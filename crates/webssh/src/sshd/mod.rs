//! Embedded SSH daemon.
//!
//! Accepts TCP connections, authenticates them against a
//! [`CredentialLookup`], and serves `shell`, `exec`, and the `sftp`
//! subsystem on each session channel.

mod auth;
mod exec;
mod handler;
mod process;
mod pty;
mod sftp;

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use russh::MethodSet;
use russh::server::Config;
use russh_keys::key::KeyPair;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub use auth::{
    AuthorizedKey, CredentialLookup, CredentialRecord, DEFAULT_AUTH_REJECTION_DELAY_MS,
    DEFAULT_MAX_AUTH_ATTEMPTS, PasswordLookup, StaticCredentials, parse_authorized_keys,
};
pub use pty::RESIZE_QUEUE_CAPACITY;

use self::handler::{ServerState, SshdHandler};
use crate::admission::{AdmissionFilter, AllowAll};
use crate::config::GatewayConfig;
use crate::task::supervise;
use crate::{Error, Result};

/// Default server version string.
pub const DEFAULT_VERSION: &str = "SSH-2.0-WebSSH";
/// Default shell for `shell` and `exec` requests.
pub const DEFAULT_SHELL: &str = "/bin/sh";
/// Unanswered keepalives tolerated before the connection is dropped.
pub const KEEPALIVE_MAX: usize = 3;

/// Where the host key comes from.
#[derive(Clone)]
pub enum HostKeySource {
    Key(Arc<KeyPair>),
    Pem(String),
    Path(PathBuf),
    /// Derived with [`hostkey::generate_rsa_pem`]. Empty means random.
    Seed(String),
}

impl fmt::Debug for HostKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(_) => f.write_str("Key(..)"),
            Self::Pem(_) => f.write_str("Pem(..)"),
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Seed(seed) if seed.is_empty() => f.write_str("Random"),
            Self::Seed(_) => f.write_str("Seed(..)"),
        }
    }
}

impl Default for HostKeySource {
    fn default() -> Self {
        Self::Seed(String::new())
    }
}

impl HostKeySource {
    /// Loads or derives the key pair.
    pub fn load(&self) -> Result<KeyPair> {
        match self {
            Self::Key(key) => Ok(key.as_ref().clone()),
            Self::Pem(pem) => Ok(russh_keys::decode_secret_key(pem, None)?),
            Self::Path(path) => Ok(russh_keys::load_secret_key(path, None)?),
            Self::Seed(seed) => {
                if seed.is_empty() {
                    info!("Generating ephemeral RSA host key");
                } else {
                    info!("Deriving RSA host key from seed");
                }
                rsa_key_pair(&hostkey::generate_rsa_pem(seed)?)
            }
        }
    }
}

/// Loads a PKCS#1 RSA key by way of PKCS#8.
fn rsa_key_pair(pkcs1_pem: &str) -> Result<KeyPair> {
    let rsa = RsaPrivateKey::from_pkcs1_pem(pkcs1_pem).map_err(|e| Error::Key(format!("PKCS1 decode error: {e}")))?;
    let pkcs8 = rsa
        .to_pkcs8_pem(Default::default())
        .map_err(|e| Error::Key(format!("PKCS8 encode error: {e}")))?;
    Ok(russh_keys::decode_secret_key(pkcs8.as_str(), None)?)
}

/// Daemon settings.
#[derive(Clone)]
pub struct ServerOptions {
    pub address: String,
    pub version: String,
    /// Sent before authentication. `{version}` is replaced with the server version.
    pub banner: Option<String>,
    pub host_key: HostKeySource,
    pub shell: String,
    pub work_dir: Option<PathBuf>,
    pub env_passthrough: bool,
    /// A `keepalive@openssh.com` request is sent after this much client
    /// silence. The connection drops after [`KEEPALIVE_MAX`] unanswered pings.
    pub keepalive_interval: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub max_auth_attempts: u32,
    pub auth_rejection_delay_ms: u64,
    pub credentials: Arc<dyn CredentialLookup>,
    pub admission: Arc<dyn AdmissionFilter>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:2222".to_string(),
            version: DEFAULT_VERSION.to_string(),
            banner: None,
            host_key: HostKeySource::default(),
            shell: DEFAULT_SHELL.to_string(),
            work_dir: None,
            env_passthrough: false,
            keepalive_interval: None,
            idle_timeout: None,
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            auth_rejection_delay_ms: DEFAULT_AUTH_REJECTION_DELAY_MS,
            credentials: Arc::new(StaticCredentials::new()),
            admission: Arc::new(AllowAll),
        }
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("address", &self.address)
            .field("version", &self.version)
            .field("banner", &self.banner)
            .field("host_key", &self.host_key)
            .field("shell", &self.shell)
            .field("work_dir", &self.work_dir)
            .field("env_passthrough", &self.env_passthrough)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_auth_attempts", &self.max_auth_attempts)
            .field("auth_rejection_delay_ms", &self.auth_rejection_delay_ms)
            .finish_non_exhaustive()
    }
}

fn render_banner(template: &str, version: &str) -> String {
    let mut banner = template.replace("{version}", version);
    if !banner.ends_with('\n') {
        banner.push_str("\r\n");
    }
    banner
}

/// Builder for [`Server`].
#[derive(Debug, Default)]
pub struct ServerBuilder {
    options: ServerOptions,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a loaded [`GatewayConfig`].
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut builder = Self::new()
            .address(config.listen_address())
            .version(config.server_version.clone())
            .shell(config.shell.clone())
            .env_passthrough(config.env_passthrough)
            .host_key_seed(config.host_key_seed.clone());
        builder.options.keepalive_interval = config.keepalive_interval();
        builder.options.work_dir.clone_from(&config.work_dir);
        builder.options.banner.clone_from(&config.banner);
        builder
    }

    pub fn address(mut self, addr: impl Into<String>) -> Self {
        self.options.address = addr.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.options.version = version.into();
        self
    }

    pub fn banner(mut self, banner: impl Into<String>) -> Self {
        self.options.banner = Some(banner.into());
        self
    }

    pub fn host_key(mut self, key: KeyPair) -> Self {
        self.options.host_key = HostKeySource::Key(Arc::new(key));
        self
    }

    pub fn host_key_pem(mut self, pem: impl Into<String>) -> Self {
        self.options.host_key = HostKeySource::Pem(pem.into());
        self
    }

    pub fn host_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.host_key = HostKeySource::Path(path.into());
        self
    }

    /// Derives the host key from `seed`. The same seed yields the same key.
    pub fn host_key_seed(mut self, seed: impl Into<String>) -> Self {
        self.options.host_key = HostKeySource::Seed(seed.into());
        self
    }

    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.options.shell = shell.into();
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.work_dir = Some(dir.into());
        self
    }

    pub fn env_passthrough(mut self, enabled: bool) -> Self {
        self.options.env_passthrough = enabled;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.options.keepalive_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.options.idle_timeout = Some(timeout);
        self
    }

    pub fn max_auth_attempts(mut self, max: u32) -> Self {
        self.options.max_auth_attempts = max;
        self
    }

    pub fn auth_rejection_delay(mut self, delay_ms: u64) -> Self {
        self.options.auth_rejection_delay_ms = delay_ms;
        self
    }

    pub fn credentials(mut self, credentials: impl CredentialLookup + 'static) -> Self {
        self.options.credentials = Arc::new(credentials);
        self
    }

    pub fn admission(mut self, filter: impl AdmissionFilter + 'static) -> Self {
        self.options.admission = Arc::new(filter);
        self
    }

    /// Resolves the host key and produces a ready server.
    pub fn build(self) -> Result<Server> {
        let config = russh_config(&self.options)?;
        Ok(Server {
            config: Arc::new(config),
            state: Arc::new(ServerState::new(self.options)),
        })
    }
}

fn russh_config(options: &ServerOptions) -> Result<Config> {
    let mut config = Config::default();
    config.server_id = russh::SshId::Standard(options.version.clone());
    config.inactivity_timeout = options.idle_timeout;
    config.keepalive_interval = options.keepalive_interval;
    config.keepalive_max = KEEPALIVE_MAX;
    config.max_auth_attempts = options.max_auth_attempts as usize;
    config.auth_rejection_time = Duration::from_millis(options.auth_rejection_delay_ms);
    config.methods = MethodSet::PASSWORD | MethodSet::PUBLICKEY;
    config.keys.push(options.host_key.load()?);

    if let Some(template) = &options.banner {
        // russh wants a &'static str; the server lives for the process.
        let banner: &'static str = Box::leak(render_banner(template, &options.version).into_boxed_str());
        config.auth_banner = Some(banner);
    }
    Ok(config)
}

/// The embedded SSH daemon.
pub struct Server {
    config: Arc<Config>,
    state: Arc<ServerState>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("options", &self.state.options)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn options(&self) -> &ServerOptions {
        &self.state.options
    }

    /// Returns the configured listen address.
    pub fn address(&self) -> &str {
        &self.state.options.address
    }

    /// Binds the configured address and serves until the task is dropped.
    pub async fn listen(&self) -> Result<()> {
        let addr: SocketAddr = self.state.options.address.parse()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener.
    ///
    /// Each connection runs in its own supervised task. Accept failures and
    /// per-connection errors are logged and never stop the loop.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "SSH daemon listening");
        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            if !self.state.options.admission.admit(peer_addr.ip()) {
                warn!(peer_addr = %peer_addr, "Connection denied by admission filter");
                drop(socket);
                continue;
            }
            info!(peer_addr = %peer_addr, "Accepted connection");

            let config = Arc::clone(&self.config);
            let handler = SshdHandler::new(peer_addr, Arc::clone(&self.state));
            supervise("sshd-connection", async move {
                match russh::server::run_stream(config, socket, handler).await {
                    Ok(session) => match session.await {
                        Ok(()) => debug!(peer_addr = %peer_addr, "Connection closed cleanly"),
                        Err(e) => warn!(peer_addr = %peer_addr, error = %e, "Connection error"),
                    },
                    Err(e) => error!(peer_addr = %peer_addr, error = %e, "SSH handshake failed"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_options() {
        let builder = ServerBuilder::new()
            .address("127.0.0.1:0")
            .version("SSH-2.0-Test")
            .shell("/bin/bash")
            .env_passthrough(true)
            .keepalive_interval(Duration::from_secs(5))
            .max_auth_attempts(2)
            .auth_rejection_delay(1);
        let options = &builder.options;
        assert_eq!(options.address, "127.0.0.1:0");
        assert_eq!(options.version, "SSH-2.0-Test");
        assert_eq!(options.shell, "/bin/bash");
        assert!(options.env_passthrough);
        assert_eq!(options.keepalive_interval, Some(Duration::from_secs(5)));
        assert_eq!(options.max_auth_attempts, 2);
        assert_eq!(options.auth_rejection_delay_ms, 1);
    }

    #[test]
    fn zero_keepalive_disables_it() {
        let builder = ServerBuilder::new().keepalive_interval(Duration::ZERO);
        assert_eq!(builder.options.keepalive_interval, None);
    }

    #[test]
    fn from_config_copies_settings() {
        let config = GatewayConfig {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 2022,
            keepalive_interval_secs: 30,
            env_passthrough: true,
            banner: Some("hello".to_string()),
            ..GatewayConfig::default()
        };
        let builder = ServerBuilder::from_config(&config);
        assert_eq!(builder.options.address, "127.0.0.1:2022");
        assert_eq!(builder.options.keepalive_interval, Some(Duration::from_secs(30)));
        assert!(builder.options.env_passthrough);
        assert_eq!(builder.options.banner.as_deref(), Some("hello"));
    }

    #[test]
    fn keepalive_reaches_russh_config() {
        let options = ServerBuilder::new()
            .host_key(KeyPair::generate_ed25519())
            .keepalive_interval(Duration::from_secs(7))
            .options;
        let config = russh_config(&options).unwrap();
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(7)));
        assert_eq!(config.keepalive_max, KEEPALIVE_MAX);

        let options = ServerBuilder::new().host_key(KeyPair::generate_ed25519()).options;
        assert_eq!(russh_config(&options).unwrap().keepalive_interval, None);
    }

    #[test]
    fn banner_substitutes_version() {
        assert_eq!(render_banner("Welcome to {version}", "SSH-2.0-X"), "Welcome to SSH-2.0-X\r\n");
        assert_eq!(render_banner("hi\n", "v"), "hi\n");
    }

    #[test]
    fn host_key_debug_hides_material() {
        let pem = HostKeySource::Pem("secret".to_string());
        assert_eq!(format!("{pem:?}"), "Pem(..)");
        assert_eq!(format!("{:?}", HostKeySource::default()), "Random");
    }

    #[test]
    fn seeded_host_key_loads_through_pkcs8() {
        let key = HostKeySource::Seed("webssh".to_string()).load().unwrap();
        assert!(key.clone_public_key().is_ok());
    }

    #[test]
    fn explicit_key_is_used() {
        let key = KeyPair::generate_ed25519();
        let loaded = HostKeySource::Key(Arc::new(key.clone())).load().unwrap();
        assert_eq!(loaded.name(), key.name());
    }
}
