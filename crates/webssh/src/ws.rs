//! Websocket endpoint for interactive terminals.
//!
//! A client upgrades with `?session_id=<id>&w=<cols>&h=<rows>`. From then
//! on binary and text frames carry raw terminal input, and terminal output
//! comes back as binary frames.

use std::net::SocketAddr;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

use crate::bridge::SessionId;
use crate::gateway::Gateway;
use crate::task::supervise;
use crate::{Error, Result, Window};

const DUPLEX_BUFFER: usize = 64 * 1024;
const READ_BUFFER: usize = 8192;

/// Query parameters of a terminal upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalParams {
    pub session_id: SessionId,
    pub window: Window,
}

impl TerminalParams {
    /// Parses `session_id`, `w`, and `h` from a query string.
    pub fn from_query(query: &str) -> Result<Self> {
        let mut session_id = None;
        let mut width = None;
        let mut height = None;

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "session_id" => session_id = Some(value.to_string()),
                "w" => width = Some(parse_dimension("w", value)?),
                "h" => height = Some(parse_dimension("h", value)?),
                _ => {}
            }
        }

        let session_id = session_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Protocol("missing session_id".to_string()))?;
        let width = width.ok_or_else(|| Error::Protocol("missing w".to_string()))?;
        let height = height.ok_or_else(|| Error::Protocol("missing h".to_string()))?;

        Ok(Self {
            session_id: SessionId::from(session_id),
            window: Window::checked(width, height)?,
        })
    }
}

fn parse_dimension(name: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| Error::Protocol(format!("{name} is not a number: {value:?}")))
}

fn bad_request(err: &Error) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Accepts websocket connections on `listener` until the task is dropped.
///
/// Accept failures are logged and the loop keeps going.
pub async fn serve(listener: TcpListener, gateway: Gateway) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "Websocket endpoint listening");
    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                let gateway = gateway.clone();
                supervise("ws-connection", async move {
                    if let Err(e) = serve_connection(gateway, socket, peer_addr).await {
                        warn!(peer_addr = %peer_addr, error = %e, "Websocket terminal ended with error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept websocket connection");
            }
        }
    }
}

/// Upgrades one connection and bridges it to its session's shell.
pub async fn serve_connection(gateway: Gateway, socket: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    if !gateway.admits(peer_addr.ip()) {
        return Err(Error::Admission(peer_addr.ip()));
    }

    let mut params = None;
    let callback = |request: &Request, response: Response| {
        match TerminalParams::from_query(request.uri().query().unwrap_or("")) {
            Ok(parsed) => {
                params = Some(parsed);
                Ok(response)
            }
            Err(e) => Err(bad_request(&e)),
        }
    };
    let ws = tokio_tungstenite::accept_hdr_async(socket, callback)
        .await
        .map_err(|e| Error::Protocol(format!("websocket handshake: {e}")))?;
    let params = params.ok_or_else(|| Error::Protocol("missing terminal parameters".to_string()))?;

    debug!(
        peer_addr = %peer_addr,
        session_id = %params.session_id,
        width = params.window.width,
        height = params.window.height,
        "Websocket terminal attached"
    );

    let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
    let (from_terminal, to_terminal) = tokio::io::split(local);
    let (sink, source) = ws.split();

    let inbound = supervise("ws-inbound", pump_input(source, to_terminal));
    let (result, ()) = tokio::join!(
        gateway.run_terminal(&params.session_id, params.window, remote),
        pump_output(from_terminal, sink),
    );
    inbound.abort();
    result
}

async fn pump_input(mut source: SplitStream<WebSocketStream<TcpStream>>, mut terminal: WriteHalf<DuplexStream>) {
    while let Some(message) = source.next().await {
        let written = match message {
            Ok(Message::Binary(bytes)) => terminal.write_all(&bytes).await,
            Ok(Message::Text(text)) => terminal.write_all(text.as_bytes()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(error = %e, "Websocket read failed");
                break;
            }
        };
        if written.is_err() {
            break;
        }
    }
    let _ = terminal.shutdown().await;
}

async fn pump_output(
    mut terminal: ReadHalf<DuplexStream>,
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
) {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        match terminal.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Err(e) = sink.send(Message::Binary(buf[..n].to_vec())).await {
                    debug!(error = %e, "Websocket write failed");
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}
