#![forbid(unsafe_code)]
// Allow pedantic lints for early-stage API ergonomics.
#![allow(clippy::doc_markdown)]
#![allow(clippy::nursery)]
#![allow(clippy::pedantic)]

//! # WebSSH
//!
//! A web-reachable SSH gateway.
//!
//! The crate has two halves:
//!
//! - **Outbound gateway**: [`Gateway`] opens SSH/SFTP connections to remote
//!   hosts on behalf of web clients, tracks them in a [`SessionRegistry`],
//!   and bridges each interactive shell onto a duplex byte stream (usually
//!   a websocket, see [`ws`]).
//! - **Embedded daemon**: [`sshd::Server`] accepts inbound SSH connections,
//!   authenticates them against a [`CredentialLookup`], and serves shells
//!   on a local PTY, one-shot exec, and an SFTP subsystem.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use webssh::{Gateway, SessionRegistry};
//! use webssh::sshd::{ServerBuilder, StaticCredentials};
//!
//! #[tokio::main]
//! async fn main() -> webssh::Result<()> {
//!     let registry = Arc::new(SessionRegistry::new());
//!     registry.start_sweeper(Duration::from_secs(15), Duration::from_secs(60));
//!     let gateway = Gateway::new(registry);
//!
//!     let server = ServerBuilder::new()
//!         .address("0.0.0.0:2222")
//!         .credentials(StaticCredentials::new().with_user("u", "p"))
//!         .host_key_seed("webssh")
//!         .build()?;
//!     server.listen().await
//! }
//! ```

use std::io;

use serde::Serialize;
use thiserror::Error;

pub mod admission;
pub mod bridge;
pub mod config;
pub mod gateway;
pub mod registry;
pub mod sshd;
pub mod task;
pub mod ws;

pub use admission::{AdmissionFilter, AllowAll, AllowList};
pub use bridge::{
    AddressFamily, BridgeSession, Credentials, Secret, SessionId, SessionView, Target, Transport,
};
pub use config::GatewayConfig;
pub use gateway::Gateway;
pub use registry::SessionRegistry;
pub use sshd::{
    CredentialLookup, CredentialRecord, PasswordLookup, Server, ServerBuilder, StaticCredentials,
};

// -----------------------------------------------------------------------------
// Error Types
// -----------------------------------------------------------------------------

/// Why an authentication attempt failed.
///
/// The daemon logs this but only ever tells the remote client that the
/// attempt was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
    /// Unknown user, wrong secret, or unrecognized key.
    BadCredential,
    /// The account exists but is switched off.
    Disabled,
    /// The account's expiry timestamp has passed.
    Expired,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadCredential => f.write_str("bad credential"),
            Self::Disabled => f.write_str("account disabled"),
            Self::Expired => f.write_str("account expired"),
        }
    }
}

/// Errors that can occur in the gateway and the embedded daemon.
///
/// # Recovery Strategies
///
/// | Error Variant | Recovery Strategy |
/// |--------------|-------------------|
/// | [`Transport`](Error::Transport) | Report connect failure; nothing was registered |
/// | [`Auth`](Error::Auth) | Expected for invalid credentials |
/// | [`Protocol`](Error::Protocol) | Close the channel; the listener keeps running |
/// | [`Process`](Error::Process) | Tell the user on the terminal stream, then close |
/// | [`SessionNotFound`](Error::SessionNotFound) | Session expired or was disconnected |
/// | [`InvalidWindow`](Error::InvalidWindow) | Reject the request unchanged |
/// | [`Sftp`](Error::Sftp) | Report to the caller; the session stays usable |
/// | [`Admission`](Error::Admission) | Peer address is not allowed |
/// | [`Io`](Error::Io) | Check permissions, port availability |
/// | [`Russh`](Error::Russh) | Treat the transport as dead |
/// | [`Key`](Error::Key) / [`KeyLoad`](Error::KeyLoad) | Verify key material |
/// | [`Configuration`](Error::Configuration) | Fix server configuration |
#[derive(Error, Debug)]
pub enum Error {
    /// Dialing or the SSH handshake with a remote host failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Authentication was refused.
    #[error("authentication failed: {0}")]
    Auth(AuthFailure),

    /// A malformed or unsupported request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A shell or command could not be spawned.
    #[error("process error: {0}")]
    Process(String),

    /// No live session has the given id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Terminal dimensions outside the accepted range.
    #[error("invalid window size {width}x{height}")]
    InvalidWindow {
        /// Requested columns.
        width: u32,
        /// Requested rows.
        height: u32,
    },

    /// An SFTP operation failed.
    #[error("sftp error: {0}")]
    Sftp(String),

    /// The admission filter refused the peer address.
    #[error("address not admitted: {0}")]
    Admission(std::net::IpAddr),

    /// Session state error, such as a shell already being attached.
    #[error("session error: {0}")]
    Session(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Underlying russh library error.
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),

    /// Key generation or conversion error.
    #[error("key error: {0}")]
    Key(String),

    /// Key decoding error from russh-keys.
    #[error("key loading error: {0}")]
    KeyLoad(#[from] russh_keys::Error),

    /// Server configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Address parse error.
    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

impl From<hostkey::Error> for Error {
    fn from(err: hostkey::Error) -> Self {
        Self::Key(err.to_string())
    }
}

/// Stable, serializable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Auth,
    Protocol,
    Process,
    SessionNotFound,
    InvalidWindow,
    Sftp,
    Admission,
    Internal,
}

/// Error payload handed to the web layer.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Error class.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl Error {
    /// Returns the error's class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::Russh(_) => ErrorKind::Transport,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Process(_) => ErrorKind::Process,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::InvalidWindow { .. } => ErrorKind::InvalidWindow,
            Self::Sftp(_) => ErrorKind::Sftp,
            Self::Admission(_) => ErrorKind::Admission,
            Self::Session(_)
            | Self::Io(_)
            | Self::Key(_)
            | Self::KeyLoad(_)
            | Self::Configuration(_)
            | Self::AddrParse(_) => ErrorKind::Internal,
        }
    }

    /// Builds the structured body returned to web clients.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    /// Whether the error means the remote transport is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Russh(_))
    }
}

/// A specialized [`Result`] type for webssh operations.
pub type Result<T> = std::result::Result<T, Error>;

// -----------------------------------------------------------------------------
// PTY Types
// -----------------------------------------------------------------------------

/// Narrowest accepted terminal, in columns.
pub const MIN_WIDTH: u32 = 40;
/// Widest accepted terminal, in columns.
pub const MAX_WIDTH: u32 = 8192;
/// Shortest accepted terminal, in rows.
pub const MIN_HEIGHT: u32 = 2;
/// Tallest accepted terminal, in rows.
pub const MAX_HEIGHT: u32 = 4096;

/// Window size information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    /// Terminal width in columns.
    pub width: u32,
    /// Terminal height in rows.
    pub height: u32,
}

impl Window {
    /// Creates a window without range checks.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Creates a window, rejecting sizes a web terminal should never send.
    pub fn checked(width: u32, height: u32) -> Result<Self> {
        if (MIN_WIDTH..=MAX_WIDTH).contains(&width) && (MIN_HEIGHT..=MAX_HEIGHT).contains(&height)
        {
            Ok(Self { width, height })
        } else {
            Err(Error::InvalidWindow { width, height })
        }
    }
}

impl Default for Window {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

/// Pseudo-terminal information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pty {
    /// Terminal type (e.g., "xterm-256color").
    pub term: String,
    /// Window dimensions.
    pub window: Window,
}

impl Default for Pty {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            window: Window::default(),
        }
    }
}
