//! One-shot command channels.

use std::process::Stdio;
use std::sync::Arc;

use russh::server::{Handle, Msg};
use russh::{ChannelStream, CryptoVec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::process::{ChannelCloser, ProcessSpec};
use crate::task::supervise;

/// Exit status reported when the command cannot be started.
pub(crate) const SPAWN_FAILURE_STATUS: u32 = 127;
/// Exit status reported when the command died without one.
pub(crate) const UNKNOWN_STATUS: u32 = 255;

const CHUNK: usize = 8192;

fn build(spec: &ProcessSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.work_dir {
        cmd.current_dir(dir);
    }
    cmd
}

/// Runs `spec` with its stdio wired to the channel.
///
/// Stdout goes out as channel data, stderr as extended data. The exit
/// status is sent before the channel closes.
pub(crate) fn spawn(
    spec: ProcessSpec,
    stream: ChannelStream<Msg>,
    handle: Handle,
    closer: Arc<ChannelCloser>,
) -> AbortHandle {
    let task = supervise("exec", async move {
        let channel = closer.channel();
        let mut child = match build(&spec).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %spec.program, error = %e, "Failed to start command");
                let message = format!("failed to start {}: {e}\r\n", spec.program);
                let _ = handle.extended_data(channel, 1, CryptoVec::from_slice(message.as_bytes())).await;
                let _ = handle.exit_status_request(channel, SPAWN_FAILURE_STATUS).await;
                closer.close().await;
                return;
            }
        };
        debug!(pid = ?child.id(), "Command started");

        let (mut channel_reader, mut channel_writer) = tokio::io::split(stream);

        let stdin = child.stdin.take().map(|mut stdin| {
            supervise("exec-stdin", async move {
                let mut buf = vec![0u8; CHUNK];
                loop {
                    match channel_reader.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stdin.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        });

        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();
        let stdout = async {
            if let Some(mut out) = child_stdout {
                let _ = tokio::io::copy(&mut out, &mut channel_writer).await;
                let _ = channel_writer.flush().await;
            }
        };
        let stderr = async {
            if let Some(err) = child_stderr {
                forward_stderr(err, &handle, channel).await;
            }
        };
        tokio::join!(stdout, stderr);

        let code = match child.wait().await {
            Ok(status) => status
                .code()
                .and_then(|c| u32::try_from(c).ok())
                .unwrap_or(UNKNOWN_STATUS),
            Err(e) => {
                warn!(error = %e, "Waiting for command failed");
                UNKNOWN_STATUS
            }
        };
        if let Some(stdin) = stdin {
            stdin.abort();
        }
        info!(exit_code = code, "Command exited");
        let _ = handle.exit_status_request(channel, code).await;
        closer.close().await;
    });
    task.abort_handle()
}

async fn forward_stderr<R: AsyncRead + Unpin>(mut err: R, handle: &Handle, channel: russh::ChannelId) {
    let mut buf = vec![0u8; CHUNK];
    loop {
        match err.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if handle
                    .extended_data(channel, 1, CryptoVec::from_slice(&buf[..n]))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}
