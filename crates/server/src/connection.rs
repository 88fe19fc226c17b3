//! Peer connection management: read/write pumps, ping/pong, send buffering.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use sluice_protocol::constants::{
    MessageType, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_NOT_IMPLEMENTED, WS_MAX_MESSAGE_SIZE,
    WS_PING_PERIOD, WS_PONG_WAIT,
};
use sluice_protocol::envelope::Message;
use sluice_protocol::messages::CreateFileRequest;
use sluice_transfer::{Command, Controller, ControllerHandle, PeerLink, UploadContext};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::binary::parse_chunk_frame;

/// Handle for sending messages to the connected peer.
///
/// Cloneable and cheap; wraps an `mpsc::Sender` and the cancel token of
/// the connection it feeds.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` if the buffer is full or the peer disconnected.
    fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }
}

impl PeerLink for Sender {
    /// A message that cannot be queued closes the connection. Sessions
    /// left without their credit or terminal message are then aborted
    /// by the controller shutdown.
    fn deliver(&self, msg: Message) {
        if self.send_msg(msg).is_err() && !self.cancel.is_cancelled() {
            tracing::warn!("peer cannot keep up, closing connection");
            self.cancel.cancel();
        }
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active connection to one peer.
///
/// Owns the pump tasks and the upload controller of the connection. The
/// controller winds down once this handle is dropped and the read pump
/// has exited.
pub struct Connection {
    controller: ControllerHandle,
    cancel: CancellationToken,
}

impl Connection {
    /// Handle to this connection's upload controller.
    pub fn controller(&self) -> ControllerHandle {
        self.controller.clone()
    }

    /// Signals the pumps to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Starts the upload controller and the read/write pumps for a WebSocket
/// connection.
///
/// Returns the [`Connection`] handle and the read task, which finishes
/// when the peer disconnects or the cancel token is triggered.
pub fn spawn_connection<S>(
    ws_stream: S,
    remote_addr: SocketAddr,
    ctx: UploadContext,
    server_cancel: CancellationToken,
) -> (Connection, JoinHandle<()>)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender {
        tx,
        cancel: cancel.clone(),
    };

    let (controller, handle) = Controller::new(ctx, sender.clone());
    tokio::spawn(controller.run());

    let conn = Connection {
        controller: handle.clone(),
        cancel: cancel.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    // Write pump.
    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    // Read pump.
    let read_cancel = cancel;
    let finished = tokio::spawn(async move {
        read_pump(ws_stream, sender, handle, read_cancel.clone()).await;
        // When read pump exits, cancel the write pump too.
        read_cancel.cancel();
        tracing::info!(%remote_addr, "peer disconnected");
    });

    (conn, finished)
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and feeds them to the controller.
async fn read_pump<S>(
    mut stream: S,
    sender: Sender,
    controller: ControllerHandle,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
{
    let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
    pong_deadline.reset();
    let mut got_pong = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = pong_deadline.tick() => {
                if !got_pong {
                    tracing::warn!("pong timeout, closing connection");
                    break;
                }
                got_pong = false;
            }

            frame = stream.next() => {
                let cmd = match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if text.len() > WS_MAX_MESSAGE_SIZE {
                            tracing::error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                            continue;
                        }
                        decode_text(&sender, &text)
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        if data.len() > WS_MAX_MESSAGE_SIZE {
                            tracing::error!("binary message exceeds max size ({} > {})", data.len(), WS_MAX_MESSAGE_SIZE);
                            continue;
                        }
                        decode_binary(&data)
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        got_pong = true;
                        pong_deadline.reset();
                        None
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = sender.tx.try_send(WsMessage::Pong(data));
                        None
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        tracing::info!("received close frame");
                        break;
                    }
                    Some(Ok(WsMessage::Frame(_))) => None, // Raw frames ignored.
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break, // Stream ended.
                };

                let Some(cmd) = cmd else { continue };
                if controller.send(cmd).await.is_err() {
                    tracing::error!("upload controller stopped, closing connection");
                    break;
                }
            }
        }
    }
}

/// Decodes a text (JSON) message into a controller command.
///
/// Malformed or unsupported messages are answered with an error here and
/// never reach the controller.
fn decode_text(sender: &Sender, text: &str) -> Option<Command> {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("invalid message JSON: {e}");
            return None;
        }
    };

    match decode_command(msg) {
        Ok(cmd) => Some(cmd),
        Err(reply) => {
            sender.deliver(reply);
            None
        }
    }
}

fn decode_command(msg: Message) -> Result<Command, Message> {
    match msg.msg_type {
        MessageType::ReqSync => Ok(Command::ReqSync { request_id: msg.id }),
        MessageType::CreateFile => match msg.parse_payload::<CreateFileRequest>() {
            Ok(Some(request)) => Ok(Command::Create {
                id: msg.id,
                request,
            }),
            Ok(None) => Err(msg.reply_error(WS_ERR_CODE_BAD_REQUEST, "missing create_file payload")),
            Err(e) => Err(msg.reply_error(
                WS_ERR_CODE_BAD_REQUEST,
                format!("invalid create_file payload: {e}"),
            )),
        },
        MessageType::Done => Ok(Command::Done { id: msg.id }),
        MessageType::Abort => Ok(Command::Abort { id: msg.id }),
        MessageType::Stream => Err(msg.reply_error(
            WS_ERR_CODE_BAD_REQUEST,
            "chunk data must be sent as binary frames",
        )),
        _ => {
            tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
            Err(msg.reply_error(WS_ERR_CODE_NOT_IMPLEMENTED, "unknown message type"))
        }
    }
}

/// Decodes a binary WebSocket frame into a chunk command.
fn decode_binary(data: &[u8]) -> Option<Command> {
    match parse_chunk_frame(data) {
        Ok((header, data)) => Some(Command::Chunk {
            id: header.id,
            data,
        }),
        Err(e) => {
            tracing::error!("failed to parse binary message: {e}");
            None
        }
    }
}
