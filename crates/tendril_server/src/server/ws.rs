//! WebSocket endpoint.
//!
//! Each accepted connection either opens a window (`?path=/page`) or
//! resumes one (`?resume=<windowId>:<pathname>:<readOffset>`). Only binary
//! messages carry protocol traffic.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::manager::{ClientLink, WindowManager};
use crate::session::{CloseReason, Outbound};

/// Close code telling the client to reload the page.
pub const RELOAD_CLOSE_CODE: u16 = 3001;

/// What a client asked for when connecting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectRequest {
    New {
        path: String,
    },
    Resume {
        window_id: String,
        path: String,
        offset: u64,
    },
}

/// Query string of the upgrade request.
#[derive(Debug, Default, Deserialize)]
struct ConnectQuery {
    path: Option<String>,
    resume: Option<String>,
}

impl ConnectRequest {
    /// Parse the query string of the upgrade request.
    pub fn parse(query: Option<&str>) -> Result<Self, SessionError> {
        let query: ConnectQuery = serde_urlencoded::from_str(query.unwrap_or_default())
            .map_err(|err| SessionError::InvalidResume(err.to_string()))?;
        if let Some(resume) = query.resume {
            return Self::parse_resume(&resume);
        }
        Ok(Self::New {
            path: query
                .path
                .filter(|path| !path.is_empty())
                .unwrap_or_else(|| "/".to_string()),
        })
    }

    // the pathname may itself contain ':', so split at the first and last one
    fn parse_resume(value: &str) -> Result<Self, SessionError> {
        let invalid = || SessionError::InvalidResume(value.to_string());
        let (window_id, rest) = value.split_once(':').ok_or_else(invalid)?;
        let (path, offset) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if window_id.is_empty() {
            return Err(invalid());
        }
        Ok(Self::Resume {
            window_id: window_id.to_string(),
            path: path.to_string(),
            offset: offset.parse().map_err(|_| invalid())?,
        })
    }
}

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, manager: WindowManager) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "tendril server listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, manager).await {
                debug!(%peer, error = %err, "connection ended with error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, manager: WindowManager) -> anyhow::Result<()> {
    let mut query = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        debug!(uri = %request.uri(), "websocket handshake");
        query = request.uri().query().map(str::to_string);
        Ok(response)
    };
    let mut socket = accept_hdr_async(stream, callback).await?;

    let link = match ConnectRequest::parse(query.as_deref()) {
        Ok(ConnectRequest::New { path }) => manager.open(&path),
        Ok(ConnectRequest::Resume {
            window_id,
            path,
            offset,
        }) => match manager.resume(&window_id, &path, offset) {
            Ok(link) => link,
            Err(err) => {
                info!(window = %window_id, error = %err, "resume refused, forcing reload");
                close(&mut socket, CloseReason::Reload).await;
                return Ok(());
            }
        },
        Err(err) => {
            warn!(error = %err, "bad connection request");
            close(&mut socket, CloseReason::Reload).await;
            return Ok(());
        }
    };

    pump(socket, link).await
}

/// Shuttle messages between the socket and the window until either side ends.
async fn pump(socket: WebSocketStream<TcpStream>, mut link: ClientLink) -> anyhow::Result<()> {
    let (mut writer, mut reader) = socket.split();
    loop {
        tokio::select! {
            message = reader.next() => {
                let Some(message) = message else {
                    break;
                };
                match message {
                    Ok(Message::Binary(payload)) => {
                        if link.send(payload).is_err() {
                            writer.send(close_message(CloseReason::Reload)).await?;
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        writer.send(Message::Pong(payload)).await?;
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(window = %link.window.id(), ?frame, "client closed websocket");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(window = %link.window.id(), error = %err, "websocket error");
                        break;
                    }
                }
            }
            outbound = link.outbound.recv() => match outbound {
                Some(Outbound::Frame(frame)) => {
                    writer.send(Message::Binary(frame)).await?;
                }
                Some(Outbound::Close(reason)) => {
                    writer.send(close_message(reason)).await?;
                    break;
                }
                None => {
                    writer.send(close_message(CloseReason::Reload)).await?;
                    break;
                }
            },
        }
    }
    Ok(())
}

async fn close(socket: &mut WebSocketStream<TcpStream>, reason: CloseReason) {
    if let Err(err) = socket.send(close_message(reason)).await {
        debug!(error = %err, "failed to send close frame");
    }
}

fn close_code(reason: CloseReason) -> CloseCode {
    match reason {
        CloseReason::Reload => CloseCode::from(RELOAD_CLOSE_CODE),
        CloseReason::Desync => CloseCode::Protocol,
        CloseReason::Dropped => CloseCode::Away,
    }
}

fn close_message(reason: CloseReason) -> Message {
    let text = match reason {
        CloseReason::Reload => "reload",
        CloseReason::Desync => "desync",
        CloseReason::Dropped => "heartbeat lost",
    };
    Message::Close(Some(CloseFrame {
        code: close_code(reason),
        reason: text.into(),
    }))
}
