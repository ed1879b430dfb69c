//! Operations the web layer calls.
//!
//! Every call resolves the session through the registry first, so a
//! disconnected or evicted session always yields
//! [`Error::SessionNotFound`] instead of touching dead handles.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::admission::{AdmissionFilter, AllowAll};
use crate::bridge::{
    self, BridgeSession, Credentials, DEFAULT_TERM, Listing, SessionId, SessionView, Target,
};
use crate::registry::SessionRegistry;
use crate::task::supervise;
use crate::{Error, Result, Window};

/// Front door for outbound bridge sessions.
#[derive(Clone)]
pub struct Gateway {
    registry: Arc<SessionRegistry>,
    admission: Arc<dyn AdmissionFilter>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Creates a gateway that admits every client address.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            admission: Arc::new(AllowAll),
        }
    }

    pub fn with_admission(mut self, admission: Arc<dyn AdmissionFilter>) -> Self {
        self.admission = admission;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Whether `ip` passes the admission filter.
    pub fn admits(&self, ip: IpAddr) -> bool {
        self.admission.admit(ip)
    }

    fn lookup(&self, id: &SessionId) -> Result<Arc<BridgeSession>> {
        self.registry
            .get(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    fn sftp_session(&self, id: &SessionId) -> Result<Arc<BridgeSession>> {
        let session = self.lookup(id)?;
        session.touch();
        Ok(session)
    }

    /// Connects to `target` and registers the new session.
    ///
    /// Nothing is registered when dialing or authentication fails.
    pub async fn create_session(
        &self,
        target: Target,
        credentials: Credentials,
        client_ip: IpAddr,
    ) -> Result<SessionId> {
        self.create_session_with_term(target, credentials, client_ip, DEFAULT_TERM)
            .await
    }

    /// Like [`create_session`](Self::create_session) with an explicit terminal type.
    pub async fn create_session_with_term(
        &self,
        target: Target,
        credentials: Credentials,
        client_ip: IpAddr,
        term: &str,
    ) -> Result<SessionId> {
        if !self.admission.admit(client_ip) {
            warn!(client_ip = %client_ip, "Client address not admitted");
            return Err(Error::Admission(client_ip));
        }

        let session = BridgeSession::connect(target, credentials, client_ip, term).await?;
        let id = session.id().clone();
        if let Some(replaced) = self.registry.put(Arc::new(session)) {
            replaced.close().await;
        }
        info!(session_id = %id, client_ip = %client_ip, "Session created");
        Ok(id)
    }

    /// Attaches `stream` to the session's interactive shell.
    ///
    /// Returns once the remote shell exits, the stream ends, or the session
    /// is closed. Once the bridge has started, the session is removed from
    /// the registry on every exit path, including a panic inside the bridge.
    /// A session whose shell is already taken is refused and left in place.
    pub async fn run_terminal<S>(&self, id: &SessionId, window: Window, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let window = Window::checked(window.width, window.height)?;
        let session = self.lookup(id)?;
        let Some(channel) = session.take_shell() else {
            warn!(session_id = %id, "Terminal refused, shell already attached");
            return Err(Error::Session("interactive shell already attached".to_string()));
        };
        session.touch();

        let bridge = supervise("terminal", async move {
            bridge::run_terminal(&session, channel, window, stream).await
        });
        let outcome = bridge.await;

        self.registry.delete(id).await;
        match outcome {
            Ok(Some(result)) => result,
            Ok(None) => Err(Error::Session("terminal bridge panicked".to_string())),
            Err(e) => Err(Error::Session(format!("terminal bridge aborted: {e}"))),
        }
    }

    /// Forwards a window change to the attached shell.
    ///
    /// A transport failure evicts the session.
    pub async fn resize_window(&self, id: &SessionId, width: u32, height: u32) -> Result<()> {
        let window = Window::checked(width, height)?;
        let session = self.lookup(id)?;
        match session.resize(window).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transport() => {
                warn!(session_id = %id, error = %e, "Resize failed, dropping session");
                self.registry.delete(id).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Runs a one-shot command alongside any attached shell.
    pub async fn exec_command(&self, id: &SessionId, command: &str) -> Result<Vec<u8>> {
        let session = self.lookup(id)?;
        session.exec(command).await
    }

    /// Closes and unregisters a session. Unknown ids are fine.
    pub async fn disconnect(&self, id: &SessionId) {
        if self.registry.delete(id).await {
            info!(session_id = %id, "Session disconnected");
        }
    }

    /// Extends a session's idle deadline.
    pub fn touch(&self, id: &SessionId) -> Result<()> {
        if self.registry.touch(id) {
            Ok(())
        } else {
            Err(Error::SessionNotFound(id.to_string()))
        }
    }

    pub fn session(&self, id: &SessionId) -> Result<SessionView> {
        self.lookup(id).map(|session| session.view())
    }

    pub fn sessions(&self) -> Vec<SessionView> {
        self.registry.sessions().iter().map(|s| s.view()).collect()
    }

    // -------------------------------------------------------------------------
    // SFTP
    // -------------------------------------------------------------------------

    pub async fn sftp_list(&self, id: &SessionId, path: &str) -> Result<Listing> {
        let session = self.sftp_session(id)?;
        match session.sftp() {
            Some(sftp) => bridge::sftp::list(sftp, path).await,
            None => Err(no_sftp()),
        }
    }

    pub async fn sftp_download(&self, id: &SessionId, path: &str) -> Result<Vec<u8>> {
        let session = self.sftp_session(id)?;
        match session.sftp() {
            Some(sftp) => bridge::sftp::download(sftp, path).await,
            None => Err(no_sftp()),
        }
    }

    pub async fn sftp_upload(&self, id: &SessionId, path: &str, contents: &[u8]) -> Result<()> {
        let session = self.sftp_session(id)?;
        match session.sftp() {
            Some(sftp) => bridge::sftp::upload(sftp, path, contents).await,
            None => Err(no_sftp()),
        }
    }

    pub async fn sftp_create_dir(&self, id: &SessionId, path: &str) -> Result<()> {
        let session = self.sftp_session(id)?;
        match session.sftp() {
            Some(sftp) => bridge::sftp::create_dir(sftp, path).await,
            None => Err(no_sftp()),
        }
    }

    pub async fn sftp_delete(&self, id: &SessionId, path: &str) -> Result<()> {
        let session = self.sftp_session(id)?;
        match session.sftp() {
            Some(sftp) => bridge::sftp::delete(sftp, path).await,
            None => Err(no_sftp()),
        }
    }
}

fn no_sftp() -> Error {
    Error::Sftp("sftp is not available for this session".to_string())
}
