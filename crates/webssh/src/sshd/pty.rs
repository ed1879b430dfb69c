//! Shell channels backed by a pseudo-terminal.

use std::io::{Read, Write};
use std::sync::Arc;

use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use russh::ChannelStream;
use russh::server::{Handle, Msg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::process::{ChannelCloser, ProcessSpec};
use crate::task::{supervise, supervise_blocking};
use crate::{Error, Pty, Result, Window};

/// Pending window changes per shell.
pub const RESIZE_QUEUE_CAPACITY: usize = 10;

const CHUNK: usize = 8192;
const PUMP_DEPTH: usize = 64;

/// A running shell attached to a channel.
///
/// Dropping the bridge kills the child and stops the pumps.
pub(crate) struct ShellBridge {
    resize_tx: mpsc::Sender<Window>,
    closer: Arc<ChannelCloser>,
    tasks: Vec<AbortHandle>,
}

impl ShellBridge {
    /// Sender side of the resize queue. Sends wait while the queue is full.
    pub fn resizer(&self) -> mpsc::Sender<Window> {
        self.resize_tx.clone()
    }
}

impl Drop for ShellBridge {
    fn drop(&mut self) {
        self.closer.kill();
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn pty_size(window: Window) -> PtySize {
    PtySize {
        rows: u16::try_from(window.height).unwrap_or(u16::MAX),
        cols: u16::try_from(window.width).unwrap_or(u16::MAX),
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn command(spec: &ProcessSpec, term: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&spec.program);
    for arg in &spec.args {
        cmd.arg(arg);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    cmd.env("TERM", term);
    if let Some(dir) = &spec.work_dir {
        cmd.cwd(dir);
    }
    cmd
}

/// Spawns `spec` on a fresh pty and wires it to `stream`.
///
/// The resize consumer is running by the time this returns, so window
/// changes sent right after the shell reply are not lost.
pub(crate) fn attach(
    spec: &ProcessSpec,
    pty: &Pty,
    stream: ChannelStream<Msg>,
    handle: Handle,
    closer: Arc<ChannelCloser>,
) -> Result<ShellBridge> {
    let process = |e: anyhow::Error| Error::Process(e.to_string());

    let pair = native_pty_system().openpty(pty_size(pty.window)).map_err(process)?;
    let mut child = pair.slave.spawn_command(command(spec, &pty.term)).map_err(process)?;
    drop(pair.slave);
    closer.set_killer(child.clone_killer());

    let mut pty_reader = pair.master.try_clone_reader().map_err(process)?;
    let mut pty_writer = pair.master.take_writer().map_err(process)?;
    let master = pair.master;

    info!(program = %spec.program, pid = ?child.process_id(), "Shell started");

    let (resize_tx, resize_rx) = mpsc::channel(RESIZE_QUEUE_CAPACITY);
    let resizer = supervise("pty-resize", consume_resizes(master, resize_rx));

    let (exit_tx, exit_rx) = oneshot::channel();
    supervise_blocking("pty-wait", move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code(),
            Err(e) => {
                debug!(error = %e, "Waiting for shell failed");
                255
            }
        };
        info!(exit_code = code, "Shell exited");
        let _ = exit_tx.send(code);
    });

    let (mut channel_reader, mut channel_writer) = tokio::io::split(stream);

    // pty -> channel
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(PUMP_DEPTH);
    supervise_blocking("pty-read", move || {
        let mut buf = vec![0u8; CHUNK];
        loop {
            match pty_reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    // channel -> pty
    let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(PUMP_DEPTH);
    supervise_blocking("pty-write", move || {
        while let Some(bytes) = in_rx.blocking_recv() {
            if pty_writer.write_all(&bytes).and_then(|()| pty_writer.flush()).is_err() {
                break;
            }
        }
    });
    let input = supervise("pty-input", async move {
        let mut buf = vec![0u8; CHUNK];
        loop {
            match channel_reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if in_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let output_closer = Arc::clone(&closer);
    let input_abort = input.abort_handle();
    let output = supervise("pty-output", async move {
        while let Some(bytes) = out_rx.recv().await {
            if channel_writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
        let _ = channel_writer.flush().await;
        input_abort.abort();
        if let Ok(code) = exit_rx.await {
            let _ = handle.exit_status_request(output_closer.channel(), code).await;
        }
        output_closer.close().await;
    });

    Ok(ShellBridge {
        resize_tx,
        closer,
        tasks: vec![resizer.abort_handle(), input.abort_handle(), output.abort_handle()],
    })
}

async fn consume_resizes(master: Box<dyn MasterPty + Send>, mut rx: mpsc::Receiver<Window>) {
    while let Some(window) = rx.recv().await {
        if let Err(e) = master.resize(pty_size(window)) {
            warn!(error = %e, "Failed to resize pty");
        } else {
            debug!(width = window.width, height = window.height, "Pty resized");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_clamp_to_u16() {
        let size = pty_size(Window::new(100_000, 40));
        assert_eq!(size.cols, u16::MAX);
        assert_eq!(size.rows, 40);
    }

    #[test]
    fn command_sets_term() {
        let spec = ProcessSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-l".to_string()],
            env: vec![("LANG".to_string(), "C".to_string())],
            work_dir: None,
        };
        let cmd = command(&spec, "vt100");
        assert_eq!(cmd.get_env("TERM").and_then(|v| v.to_str()), Some("vt100"));
        assert_eq!(cmd.get_env("LANG").and_then(|v| v.to_str()), Some("C"));
    }
}
