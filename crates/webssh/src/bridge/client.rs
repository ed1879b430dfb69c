//! SSH client transport for bridge sessions.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{BridgeSession, Credentials, Secret, SessionId, Target, Transport};
use crate::{AuthFailure, Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side handler that accepts any host key.
///
/// Targets are chosen by the operator, not by arbitrary users, so the
/// gateway trusts whatever key the target presents. Deployments that need
/// strict checking should verify against known hosts here.
struct AcceptAnyHostKey {
    target: String,
}

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(
            target = %self.target,
            key_type = server_public_key.name(),
            fingerprint = %server_public_key.fingerprint(),
            "Accepting remote host key without verification"
        );
        Ok(true)
    }
}

/// An authenticated SSH client connection.
pub struct SshTransport {
    handle: Handle<AcceptAnyHostKey>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, command: &str) -> Result<Vec<u8>> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut output = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, .. } => output.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => {
                    debug!(command, exit_status, "Remote command exited");
                }
                ChannelMsg::Failure => {
                    return Err(Error::Process(format!("remote refused to run {command:?}")));
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        if let Err(e) = channel.close().await {
            debug!(error = %e, "Exec channel already closed");
        }
        Ok(output)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handle.is_closed()
    }
}

async fn dial(target: &Target) -> Result<TcpStream> {
    let addrs = lookup_host((target.host.as_str(), target.port))
        .await
        .map_err(|e| Error::Transport(format!("resolve {target}: {e}")))?;

    let mut last_error = format!("no {} address for {}", target.family, target.host);
    for addr in addrs.filter(|addr| target.family.accepts(addr)) {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_error = format!("{addr}: {e}"),
            Err(_) => last_error = format!("{addr}: connect timed out"),
        }
    }
    Err(Error::Transport(format!("dial {target}: {last_error}")))
}

async fn authenticate(handle: &mut Handle<AcceptAnyHostKey>, credentials: &Credentials) -> Result<()> {
    let user = credentials.username.as_str();
    let accepted = match &credentials.secret {
        Secret::Password(password) => handle.authenticate_password(user, password).await?,
        Secret::PrivateKey { pem, passphrase } => {
            let passphrase = passphrase.as_deref().filter(|p| !p.is_empty());
            let key = russh_keys::decode_secret_key(pem, passphrase)?;
            handle.authenticate_publickey(user, Arc::new(key)).await?
        }
    };

    if accepted {
        Ok(())
    } else {
        Err(Error::Auth(AuthFailure::BadCredential))
    }
}

async fn open_sftp(handle: &Handle<AcceptAnyHostKey>) -> Result<SftpSession> {
    let channel = handle.channel_open_session().await?;
    channel.request_subsystem(true, "sftp").await?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| Error::Sftp(e.to_string()))
}

pub(super) async fn connect(
    target: Target,
    credentials: Credentials,
    client_ip: IpAddr,
    term: &str,
) -> Result<BridgeSession> {
    let stream = dial(&target).await?;
    let config = Arc::new(client::Config::default());
    let handler = AcceptAnyHostKey {
        target: target.to_string(),
    };
    let mut handle = client::connect_stream(config, stream, handler)
        .await
        .map_err(|e| Error::Transport(format!("handshake with {target}: {e}")))?;

    authenticate(&mut handle, &credentials).await?;

    let shell = handle.channel_open_session().await?;

    let sftp = match open_sftp(&handle).await {
        Ok(sftp) => Some(sftp),
        Err(e) => {
            warn!(target = %target, error = %e, "SFTP unavailable, continuing without file transfer");
            None
        }
    };

    info!(
        target = %target,
        user = %credentials.username,
        client_ip = %client_ip,
        sftp = sftp.is_some(),
        "Bridge session connected"
    );

    let transport = Arc::new(SshTransport {
        handle,
        closed: AtomicBool::new(false),
    });
    Ok(BridgeSession::new(SessionId::generate(), target, credentials, client_ip, transport)
        .with_term(term)
        .with_sftp(sftp)
        .with_shell(shell))
}
