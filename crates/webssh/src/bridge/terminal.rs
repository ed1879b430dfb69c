//! Drives an interactive remote shell over a duplex byte stream.

use russh::{Channel, ChannelMsg, client};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::{BridgeSession, ShellCommand};
use crate::{Error, Result, Window};

const READ_BUFFER: usize = 8192;

/// Waits for the reply to a `want_reply` channel request.
async fn await_reply(channel: &mut Channel<client::Msg>, request: &str) -> Result<()> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(Error::Process(format!("remote refused {request}")));
            }
            Some(ChannelMsg::Close) | None => {
                return Err(Error::Transport(format!("channel closed during {request}")));
            }
            Some(other) => debug!(?other, request, "Ignoring message while awaiting reply"),
        }
    }
}

async fn start_shell(channel: &mut Channel<client::Msg>, term: &str, window: Window) -> Result<()> {
    channel
        .request_pty(true, term, window.width, window.height, 0, 0, &[])
        .await?;
    await_reply(channel, "pty-req").await?;
    channel.request_shell(true).await?;
    await_reply(channel, "shell").await
}

/// Bridges `channel`, the session's shell channel, onto `stream` until
/// either side ends.
///
/// Remote output goes to the stream unchanged and stream input goes to the
/// remote shell. Resize and close commands arrive on the session's control
/// queue. Spawn failures are written to the stream before returning.
pub(crate) async fn run_terminal<S>(
    session: &BridgeSession,
    mut channel: Channel<client::Msg>,
    window: Window,
    stream: S,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut input, mut output) = tokio::io::split(stream);

    if let Err(e) = start_shell(&mut channel, session.term(), window).await {
        let message = format!("\r\nfailed to start shell: {e}\r\n");
        if let Err(write_err) = output.write_all(message.as_bytes()).await {
            debug!(error = %write_err, "Could not report shell failure to client");
        }
        let _ = output.shutdown().await;
        return Err(e);
    }

    let mut control = session.attach_control();
    let mut buf = vec![0u8; READ_BUFFER];
    let result = loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if let Err(e) = output.write_all(&data).await {
                        break Err(Error::Io(e));
                    }
                    if let Err(e) = output.flush().await {
                        break Err(Error::Io(e));
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(session_id = %session.id(), exit_status, "Remote shell exited");
                }
                Some(ChannelMsg::Close) | None => break Ok(()),
                Some(_) => {}
            },
            read = input.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    session.touch();
                    if let Err(e) = channel.data(&buf[..n]).await {
                        break Err(Error::Russh(e));
                    }
                }
                Err(e) => break Err(Error::Io(e)),
            },
            cmd = control.recv() => match cmd {
                Some(ShellCommand::Resize { window, reply }) => {
                    let applied = channel
                        .window_change(window.width, window.height, 0, 0)
                        .await
                        .map_err(Error::from);
                    let _ = reply.send(applied);
                }
                Some(ShellCommand::Close) | None => break Ok(()),
            },
        }
    };

    if let Err(e) = output.shutdown().await {
        debug!(error = %e, "Duplex stream already closed");
    }
    if let Err(e) = channel.close().await {
        debug!(error = %e, "Shell channel already closed");
    }
    if let Err(e) = &result {
        warn!(session_id = %session.id(), error = %e, "Terminal bridge ended with error");
    }
    result
}
