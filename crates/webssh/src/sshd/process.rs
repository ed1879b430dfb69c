//! Pieces shared by the shell and exec paths.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use portable_pty::ChildKiller;
use russh::ChannelId;
use russh::server::Handle;
use tracing::debug;

/// What to spawn for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub work_dir: Option<PathBuf>,
}

impl ProcessSpec {
    /// An interactive login of `shell`.
    pub fn shell(shell: &str, env: &HashMap<String, String>, work_dir: Option<PathBuf>) -> Self {
        Self {
            program: shell.to_string(),
            args: Vec::new(),
            env: sorted_env(env),
            work_dir,
        }
    }

    /// `shell -c command`.
    pub fn command(
        shell: &str,
        command: &str,
        env: &HashMap<String, String>,
        work_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            program: shell.to_string(),
            args: vec!["-c".to_string(), command.to_string()],
            env: sorted_env(env),
            work_dir,
        }
    }
}

fn sorted_env(env: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut pairs: Vec<_> = env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    pairs.sort();
    pairs
}

/// Closes one channel exactly once, whichever task gets there first.
///
/// Also kills the attached process, if one was registered.
pub(crate) struct ChannelCloser {
    handle: Handle,
    channel: ChannelId,
    closed: AtomicBool,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
}

impl ChannelCloser {
    pub fn new(handle: Handle, channel: ChannelId) -> Self {
        Self {
            handle,
            channel,
            closed: AtomicBool::new(false),
            killer: Mutex::new(None),
        }
    }

    pub fn set_killer(&self, killer: Box<dyn ChildKiller + Send + Sync>) {
        *self.killer.lock() = Some(killer);
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Kills the registered process without touching the channel.
    pub fn kill(&self) {
        if let Some(mut killer) = self.killer.lock().take() {
            // Fails when the process already exited.
            let _ = killer.kill();
        }
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.kill();
        if self.handle.eof(self.channel).await.is_err() {
            debug!(channel = ?self.channel, "EOF on a channel that is already gone");
        }
        if self.handle.close(self.channel).await.is_err() {
            debug!(channel = ?self.channel, "Close on a channel that is already gone");
        }
    }
}
