//! russh `Handler` for the embedded daemon.
//!
//! One [`SshdHandler`] serves one TCP connection. Each session channel gets a
//! [`ChannelState`] that walks the [`ChannelPhase`] machine: a pty may be
//! configured any number of times, then exactly one of shell, exec, or the
//! sftp subsystem is started.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use russh::server::{Auth, Handler as RusshHandler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::PublicKeyBase64;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use super::ServerOptions;
use super::exec;
use super::process::{ChannelCloser, ProcessSpec};
use super::pty::{self, ShellBridge};
use super::sftp;
use crate::task::supervise;
use crate::{Error, Pty, Window};

/// What a channel has been asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Activity {
    Shell,
    Exec,
    Sftp,
}

/// Lifecycle of one session channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelPhase {
    AwaitingRequest,
    PtyConfigured,
    ShellAttached,
    ExecRunning,
    SftpServing,
    Closed,
}

impl ChannelPhase {
    pub fn accepts_pty(self) -> bool {
        matches!(self, Self::AwaitingRequest | Self::PtyConfigured)
    }

    /// The phase after starting `activity`, or `None` if the channel is
    /// already running something.
    pub fn begin(self, activity: Activity) -> Option<Self> {
        if !self.accepts_pty() {
            return None;
        }
        Some(match activity {
            Activity::Shell => Self::ShellAttached,
            Activity::Exec => Self::ExecRunning,
            Activity::Sftp => Self::SftpServing,
        })
    }
}

struct ChannelState {
    phase: ChannelPhase,
    channel: Option<Channel<Msg>>,
    pty: Option<Pty>,
    env: HashMap<String, String>,
    shell: Option<ShellBridge>,
    tasks: Vec<AbortHandle>,
}

impl ChannelState {
    fn new(channel: Channel<Msg>) -> Self {
        Self {
            phase: ChannelPhase::AwaitingRequest,
            channel: Some(channel),
            pty: None,
            env: HashMap::new(),
            shell: None,
            tasks: Vec::new(),
        }
    }

    /// Moves to the phase for `activity` and hands out the channel.
    fn start(&mut self, activity: Activity) -> Option<Channel<Msg>> {
        let next = self.phase.begin(activity)?;
        let channel = self.channel.take()?;
        self.phase = next;
        Some(channel)
    }
}

impl Drop for ChannelState {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// State shared by every connection of one server.
pub(crate) struct ServerState {
    pub options: ServerOptions,
    connection_counter: AtomicU64,
}

impl ServerState {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            connection_counter: AtomicU64::new(0),
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn sftp_root(&self) -> PathBuf {
        self.options
            .work_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"))
    }
}

/// Handler for a single daemon connection.
pub(crate) struct SshdHandler {
    connection_id: u64,
    remote_addr: SocketAddr,
    state: Arc<ServerState>,
    user: Option<String>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl SshdHandler {
    pub fn new(remote_addr: SocketAddr, state: Arc<ServerState>) -> Self {
        let connection_id = state.next_connection_id();
        debug!(connection_id, remote_addr = %remote_addr, "New connection handler created");
        Self {
            connection_id,
            remote_addr,
            state,
            user: None,
            channels: HashMap::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }

    fn process_spec(&self, state: &ChannelState, command: Option<&str>) -> ProcessSpec {
        let options = &self.state.options;
        match command {
            Some(command) => {
                ProcessSpec::command(&options.shell, command, &state.env, options.work_dir.clone())
            }
            None => ProcessSpec::shell(&options.shell, &state.env, options.work_dir.clone()),
        }
    }
}

#[async_trait]
impl RusshHandler for SshdHandler {
    type Error = Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        debug!(connection_id = self.connection_id, user, "Password auth attempt");

        let lookup = self.state.options.credentials.by_password(user, password).await;
        match lookup.verdict(user) {
            Ok(identity) => {
                info!(connection_id = self.connection_id, user, identity = %identity, "Password auth accepted");
                self.user = Some(identity);
                Ok(Auth::Accept)
            }
            Err(reason) => {
                // The client only ever sees a generic rejection.
                warn!(
                    connection_id = self.connection_id,
                    remote_addr = %self.remote_addr,
                    user,
                    reason = %reason,
                    "Password auth denied"
                );
                Ok(Self::reject())
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh_keys::key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(
            connection_id = self.connection_id,
            user,
            key_type = public_key.name(),
            "Public key auth attempt"
        );

        let keys = self.state.options.credentials.authorized_keys().await;
        if let Some(label) = keys.get(&public_key.public_key_bytes()) {
            info!(connection_id = self.connection_id, user, key = %label, "Public key auth accepted");
            self.user = Some(user.to_string());
            return Ok(Auth::Accept);
        }

        debug!(connection_id = self.connection_id, user, "Public key auth rejected");
        Ok(Self::reject())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        debug!(
            connection_id = self.connection_id,
            channel = ?id,
            user = ?self.user,
            client = %String::from_utf8_lossy(session.remote_sshid()),
            "Session channel opened"
        );

        self.channels.insert(id, ChannelState::new(channel));
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(
            connection_id = self.connection_id,
            channel = ?channel.id(),
            host = host_to_connect,
            port = port_to_connect,
            "Rejecting unknown channel type"
        );
        Ok(false)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            connection_id = self.connection_id,
            channel = ?channel,
            term,
            width = col_width,
            height = row_height,
            "PTY request"
        );

        match self.channels.get_mut(&channel) {
            Some(state) if state.phase.accepts_pty() => {
                let term = if term.is_empty() {
                    Pty::default().term
                } else {
                    term.to_string()
                };
                state.pty = Some(Pty {
                    term,
                    window: Window::new(col_width, row_height),
                });
                state.phase = ChannelPhase::PtyConfigured;
                session.channel_success(channel);
            }
            _ => session.channel_failure(channel),
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        trace!(
            connection_id = self.connection_id,
            channel = ?channel,
            width = col_width,
            height = row_height,
            "Window change request"
        );

        let window = Window::new(col_width, row_height);
        let Some(state) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        if let Some(shell) = &state.shell {
            // Waits for room in the queue so no size is lost and order holds.
            let resizer = shell.resizer();
            if resizer.send(window).await.is_err() {
                debug!(connection_id = self.connection_id, channel = ?channel, "Shell gone, window change ignored");
            }
        } else if let Some(pty) = &mut state.pty {
            pty.window = window;
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        trace!(
            connection_id = self.connection_id,
            channel = ?channel,
            name = variable_name,
            "Environment variable request"
        );

        if !self.state.options.env_passthrough {
            session.channel_failure(channel);
            return Ok(());
        }
        match self.channels.get_mut(&channel) {
            Some(state) => {
                state
                    .env
                    .insert(variable_name.to_string(), variable_value.to_string());
                session.channel_success(channel);
            }
            None => session.channel_failure(channel),
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(connection_id = self.connection_id, channel = ?channel, "Shell request");

        let Some(state) = self.channels.get(&channel) else {
            session.channel_failure(channel);
            return Ok(());
        };
        let spec = self.process_spec(state, None);

        let Some(state) = self.channels.get_mut(&channel) else {
            session.channel_failure(channel);
            return Ok(());
        };
        let Some(ssh_channel) = state.start(Activity::Shell) else {
            warn!(connection_id = self.connection_id, channel = ?channel, "Channel already running, rejecting shell");
            session.channel_failure(channel);
            return Ok(());
        };

        let pty = state.pty.clone().unwrap_or_default();
        let closer = Arc::new(ChannelCloser::new(session.handle(), channel));
        match pty::attach(&spec, &pty, ssh_channel.into_stream(), session.handle(), closer) {
            Ok(bridge) => {
                state.shell = Some(bridge);
                session.channel_success(channel);
            }
            Err(e) => {
                warn!(connection_id = self.connection_id, channel = ?channel, error = %e, "Failed to start shell");
                state.phase = ChannelPhase::Closed;
                let message = format!("failed to start shell: {e}\r\n");
                session.extended_data(channel, 1, CryptoVec::from_slice(message.as_bytes()));
                session.channel_failure(channel);
                session.close(channel);
            }
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        debug!(connection_id = self.connection_id, channel = ?channel, command = %command, "Exec request");

        let Some(state) = self.channels.get(&channel) else {
            session.channel_failure(channel);
            return Ok(());
        };
        let spec = self.process_spec(state, Some(&command));

        let Some(state) = self.channels.get_mut(&channel) else {
            session.channel_failure(channel);
            return Ok(());
        };
        let Some(ssh_channel) = state.start(Activity::Exec) else {
            warn!(connection_id = self.connection_id, channel = ?channel, "Channel already running, rejecting exec");
            session.channel_failure(channel);
            return Ok(());
        };

        session.channel_success(channel);
        let closer = Arc::new(ChannelCloser::new(session.handle(), channel));
        let task = exec::spawn(spec, ssh_channel.into_stream(), session.handle(), closer);
        state.tasks.push(task);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(connection_id = self.connection_id, channel = ?channel, subsystem = name, "Subsystem request");

        if name != "sftp" {
            debug!(connection_id = self.connection_id, subsystem = name, "Unsupported subsystem");
            session.channel_failure(channel);
            return Ok(());
        }
        let root = self.state.sftp_root();
        let Some(state) = self.channels.get_mut(&channel) else {
            session.channel_failure(channel);
            return Ok(());
        };
        let Some(ssh_channel) = state.start(Activity::Sftp) else {
            warn!(connection_id = self.connection_id, channel = ?channel, "Channel already running, rejecting subsystem");
            session.channel_failure(channel);
            return Ok(());
        };

        session.channel_success(channel);
        let closer = ChannelCloser::new(session.handle(), channel);
        let stream = ssh_channel.into_stream();
        let task = supervise("sftp", async move {
            sftp::serve(stream, root).await;
            closer.close().await;
        });
        state.tasks.push(task.abort_handle());
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        trace!(connection_id = self.connection_id, channel = ?channel, "Channel EOF");
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(connection_id = self.connection_id, channel = ?channel, "Channel closed");
        if let Some(mut state) = self.channels.remove(&channel) {
            state.phase = ChannelPhase::Closed;
        }
        Ok(())
    }
}

impl Drop for SshdHandler {
    fn drop(&mut self) {
        debug!(
            connection_id = self.connection_id,
            channels = self.channels.len(),
            "Connection handler dropped"
        );
    }
}
