//! Outbound bridge sessions.
//!
//! A [`BridgeSession`] owns one authenticated SSH connection to a remote
//! host: the transport, an optional SFTP subchannel, the not-yet-attached
//! interactive shell channel, and the control queue of an attached shell.
//! Closing it releases each of those exactly once.

mod client;
pub mod sftp;
mod terminal;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use russh::Channel;
use russh_sftp::client::SftpSession;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{Error, Result, Window};

pub use client::SshTransport;
pub use sftp::{Breadcrumb, DirEntryView, Listing, breadcrumbs};
pub(crate) use terminal::run_terminal;

/// Capacity of an attached shell's control queue.
const CONTROL_QUEUE_CAPACITY: usize = 10;

/// Default terminal type requested from remote hosts.
pub const DEFAULT_TERM: &str = "xterm-256color";

// -----------------------------------------------------------------------------
// Identity and target
// -----------------------------------------------------------------------------

/// Opaque, unique session token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Address family used to dial the remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// Either IPv4 or IPv6.
    #[default]
    Tcp,
    /// IPv4 only.
    Tcp4,
    /// IPv6 only.
    Tcp6,
}

impl AddressFamily {
    /// Whether a resolved address belongs to this family.
    pub fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Tcp => true,
            Self::Tcp4 => addr.is_ipv4(),
            Self::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl FromStr for AddressFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            other => Err(Error::Configuration(format!(
                "unknown address family: {other}"
            ))),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
        })
    }
}

/// Remote endpoint of a bridge session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub family: AddressFamily,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            family: AddressFamily::Tcp,
        }
    }

    pub fn with_family(mut self, family: AddressFamily) -> Self {
        self.family = family;
        self
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// -----------------------------------------------------------------------------
// Credentials
// -----------------------------------------------------------------------------

/// Secret material for remote authentication.
///
/// `Debug` never prints the secret, and the type is not serializable.
#[derive(Clone)]
pub enum Secret {
    Password(String),
    /// OpenSSH or PEM private key. A passphrase, when present, is required
    /// to decode it.
    PrivateKey {
        pem: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("pem", &"<redacted>")
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Username plus secret for a remote host.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub secret: Secret,
}

impl Credentials {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::Password(password.into()),
        }
    }

    pub fn private_key(
        username: impl Into<String>,
        pem: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Self {
            username: username.into(),
            secret: Secret::PrivateKey {
                pem: pem.into(),
                passphrase,
            },
        }
    }
}

// -----------------------------------------------------------------------------
// Transport seam
// -----------------------------------------------------------------------------

/// The connection-level operations a bridge session needs from its transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Runs `command` on a fresh channel and returns its combined output.
    async fn exec(&self, command: &str) -> Result<Vec<u8>>;

    /// Tears the connection down.
    async fn close(&self) -> Result<()>;

    /// Whether the connection is gone.
    fn is_closed(&self) -> bool;
}

/// Messages to the task driving an attached shell.
#[derive(Debug)]
pub(crate) enum ShellCommand {
    Resize {
        window: Window,
        reply: oneshot::Sender<Result<()>>,
    },
    Close,
}

// -----------------------------------------------------------------------------
// Bridge session
// -----------------------------------------------------------------------------

struct Activity {
    instant: Instant,
    wall: DateTime<Utc>,
}

impl Activity {
    fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }
}

/// A live, authenticated connection to a remote SSH endpoint.
pub struct BridgeSession {
    id: SessionId,
    target: Target,
    credentials: Credentials,
    term: String,
    client_ip: IpAddr,
    started_at: DateTime<Utc>,
    activity: Mutex<Activity>,
    transport: Arc<dyn Transport>,
    sftp: Option<SftpSession>,
    shell: Mutex<Option<Channel<russh::client::Msg>>>,
    control: Mutex<Option<mpsc::Sender<ShellCommand>>>,
    closed: AtomicBool,
}

impl fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeSession")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("username", &self.credentials.username)
            .field("client_ip", &self.client_ip)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl BridgeSession {
    /// Wraps an established transport.
    pub fn new(
        id: SessionId,
        target: Target,
        credentials: Credentials,
        client_ip: IpAddr,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let activity = Activity::now();
        Self {
            id,
            target,
            credentials,
            term: DEFAULT_TERM.to_string(),
            client_ip,
            started_at: activity.wall,
            activity: Mutex::new(activity),
            transport,
            sftp: None,
            shell: Mutex::new(None),
            control: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Sets the terminal type requested for the interactive shell.
    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }

    pub(crate) fn with_sftp(mut self, sftp: Option<SftpSession>) -> Self {
        self.sftp = sftp;
        self
    }

    pub(crate) fn with_shell(self, channel: Channel<russh::client::Msg>) -> Self {
        *self.shell.lock() = Some(channel);
        self
    }

    /// Dials `target`, authenticates, and opens the shell and SFTP channels.
    pub async fn connect(
        target: Target,
        credentials: Credentials,
        client_ip: IpAddr,
        term: &str,
    ) -> Result<Self> {
        client::connect(target, credentials, client_ip, term).await
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn username(&self) -> &str {
        &self.credentials.username
    }

    pub fn term(&self) -> &str {
        &self.term
    }

    pub fn client_ip(&self) -> IpAddr {
        self.client_ip
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        self.activity.lock().wall
    }

    /// Time since the last recorded activity.
    pub fn idle_time(&self) -> Duration {
        self.activity.lock().instant.elapsed()
    }

    /// Records activity now.
    pub fn touch(&self) {
        *self.activity.lock() = Activity::now();
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        let mut activity = self.activity.lock();
        if let Some(instant) = activity.instant.checked_sub(by) {
            activity.instant = instant;
        }
    }

    pub fn sftp(&self) -> Option<&SftpSession> {
        self.sftp.as_ref()
    }

    /// Whether an interactive shell is currently driven by a terminal task.
    pub fn shell_attached(&self) -> bool {
        self.control.lock().is_some()
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the underlying transport reports itself closed.
    pub fn transport_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Public projection without secrets.
    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.id.clone(),
            host: self.target.host.clone(),
            port: self.target.port,
            family: self.target.family,
            username: self.credentials.username.clone(),
            term: self.term.clone(),
            client_ip: self.client_ip,
            started_at: self.started_at,
            last_active_at: self.last_active_at(),
            sftp_available: self.sftp.is_some(),
            shell_attached: self.shell_attached(),
        }
    }

    /// Runs a command on a fresh channel, leaving any attached shell alone.
    pub async fn exec(&self, command: &str) -> Result<Vec<u8>> {
        self.touch();
        self.transport.exec(command).await
    }

    /// Sends one window-change to the attached shell.
    pub async fn resize(&self, window: Window) -> Result<()> {
        let sender = self
            .control
            .lock()
            .clone()
            .ok_or_else(|| Error::Session("no interactive shell attached".to_string()))?;

        let (reply, rx) = oneshot::channel();
        sender
            .send(ShellCommand::Resize { window, reply })
            .await
            .map_err(|_| Error::Transport("shell task has stopped".to_string()))?;
        let result = rx
            .await
            .map_err(|_| Error::Transport("shell task dropped the resize".to_string()))?;
        if result.is_ok() {
            self.touch();
        }
        result
    }

    pub(crate) fn take_shell(&self) -> Option<Channel<russh::client::Msg>> {
        self.shell.lock().take()
    }

    /// Installs the control queue for a terminal task.
    pub(crate) fn attach_control(&self) -> mpsc::Receiver<ShellCommand> {
        let (tx, rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
        *self.control.lock() = Some(tx);
        rx
    }

    /// Releases every owned handle. Later calls do nothing.
    ///
    /// Each close is attempted even when an earlier one fails.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = %self.id, target = %self.target, "Closing bridge session");

        let control = self.control.lock().take();
        if let Some(control) = control {
            // The terminal task owns the duplex stream and shuts it down on exit.
            if control.try_send(ShellCommand::Close).is_err() {
                debug!(session_id = %self.id, "Terminal task already gone");
            }
        }

        if let Some(sftp) = &self.sftp
            && let Err(e) = sftp.close().await
        {
            debug!(session_id = %self.id, error = %e, "SFTP close failed");
        }

        let shell = self.shell.lock().take();
        if let Some(shell) = shell
            && let Err(e) = shell.close().await
        {
            debug!(session_id = %self.id, error = %e, "Shell channel close failed");
        }

        if let Err(e) = self.transport.close().await {
            warn!(session_id = %self.id, error = %e, "Transport close failed");
        }
    }
}

/// Serializable view of a bridge session for the web layer.
///
/// Built field by field from the session so secrets cannot leak into it.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub host: String,
    pub port: u16,
    pub family: AddressFamily,
    pub username: String,
    pub term: String,
    pub client_ip: IpAddr,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub sftp_available: bool,
    pub shell_attached: bool,
}
