//! Per-connection live channel (hub side).
//!
//! After the HTTP upgrade hands over the raw stream, each connection runs a read loop on the
//! connection's own task and a write task fed by an unbounded channel of
//! [`Outbound`] items. The registry holds a clone of the channel sender as
//! the peer's [`LiveBinding`], so pushes from anywhere in the hub go through
//! the same writer and keep FIFO order.
//!
//! Teardown is guarded: whatever path leaves the read loop, the hub is told
//! the connection closed and drops its bindings.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::framing::{self, close_code, FrameDecoder, Message};
use crate::constants::READ_BUFFER_SIZE;
use crate::hub::messages::{self, Inbound};
use crate::hub::{
    parse_optional_session_id, CompletionSource, HeartbeatAttrs, Hub, LiveBinding, Outbound,
    RegisterAttrs,
};

/// Whether the read loop should keep going after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// State owned by one live connection's read loop.
struct LiveConn {
    hub: Hub,
    conn_id: u64,
    tx: UnboundedSender<Outbound>,
    /// Session registered on this connection, used when a message omits `sessionId`.
    session: Option<String>,
}

impl std::fmt::Debug for LiveConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConn")
            .field("conn_id", &self.conn_id)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Serve an upgraded connection until it closes.
pub(crate) async fn serve<S>(stream: S, hub: Hub)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let conn_id = hub.connection_opened();
    let _guard = scopeguard::guard((hub.clone(), conn_id), |(hub, conn_id)| {
        hub.connection_closed(conn_id);
    });

    let (mut reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let mut write_handle = tokio::spawn(write_loop(conn_id, writer, rx));

    let mut conn = LiveConn {
        hub,
        conn_id,
        tx,
        session: None,
    };
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut input = Vec::new();

    log::debug!("[Live] Connection {} opened", conn_id);

    'read: loop {
        if !input.is_empty() {
            match decoder.feed(&input) {
                Ok(frames) => {
                    for frame in frames {
                        if conn.handle_frame(frame) == Flow::Close {
                            break 'read;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("[Live] Protocol error on connection {}: {e}", conn_id);
                    let _ = conn.tx.send(Outbound::Close(close_code::PROTOCOL_ERROR));
                    break;
                }
            }
            input.clear();
        }

        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    log::debug!("[Live] Connection {} reached EOF", conn_id);
                    break;
                }
                Ok(n) => input.extend_from_slice(&buf[..n]),
                Err(e) => {
                    log::warn!("[Live] Read error on connection {}: {e}", conn_id);
                    break;
                }
            },
            // Writer stopped: close requested (eviction, shutdown) or socket gone.
            _ = &mut write_handle => break,
        }
    }
}

async fn write_loop<W>(conn_id: u64, mut writer: W, mut rx: UnboundedReceiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = rx.recv().await {
        let (bytes, last) = match item {
            Outbound::Frame(bytes) => (bytes, false),
            Outbound::Close(code) => (framing::encode_close(code), true),
        };
        if let Err(e) = writer.write_all(&bytes).await {
            log::debug!("[Live] Write error on connection {}: {e}", conn_id);
            break;
        }
        if last {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

impl LiveConn {
    fn reply(&self, message: &Value) {
        let _ = self
            .tx
            .send(Outbound::Frame(framing::encode_text(&message.to_string())));
    }

    fn reply_error(&self, message: impl Into<String>) {
        self.reply(&messages::error(message));
    }

    fn handle_frame(&mut self, frame: Message) -> Flow {
        match frame {
            Message::Text(text) => {
                self.handle_text(&text);
                Flow::Continue
            }
            Message::Ping(payload) => {
                let _ = self.tx.send(Outbound::Frame(framing::encode_pong(&payload)));
                Flow::Continue
            }
            Message::Pong(_) => Flow::Continue,
            Message::Close(code) => {
                log::debug!("[Live] Peer closed connection {} ({:?})", self.conn_id, code);
                let _ = self.tx.send(Outbound::Close(close_code::NORMAL));
                Flow::Close
            }
        }
    }

    /// Session named in a message, falling back to the one registered here.
    fn resolve(&self, session_id: Option<String>) -> Option<String> {
        session_id
            .filter(|id| !id.is_empty())
            .or_else(|| self.session.clone())
    }

    fn handle_text(&mut self, text: &str) {
        let inbound = match Inbound::parse(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                log::debug!("[Live] Bad message on connection {}: {e}", self.conn_id);
                self.reply_error(format!("Invalid message: {e}"));
                return;
            }
        };

        match inbound {
            Inbound::Register(msg) => {
                let session_id = msg.session_id.clone();
                let attrs = RegisterAttrs {
                    role: msg.role,
                    task_id: msg.task_id,
                    pressure: msg.pressure,
                    capabilities: msg.capabilities,
                };
                let binding = LiveBinding {
                    conn_id: self.conn_id,
                    tx: self.tx.clone(),
                };
                match self.hub.register(session_id.as_deref(), attrs, Some(binding)) {
                    Ok(_) => self.session = session_id,
                    Err(e) => self.reply_error(e.to_string()),
                }
            }
            Inbound::Heartbeat(msg) => {
                let session_id = self.resolve(msg.session_id);
                let attrs = HeartbeatAttrs {
                    task_id: msg.task_id,
                    pressure: msg.pressure,
                };
                if let Err(e) = self.hub.heartbeat(session_id.as_deref(), attrs) {
                    self.reply_error(e.to_string());
                }
            }
            Inbound::TaskComplete(msg) => {
                let session_id = self.resolve(msg.session_id);
                let completed = self.hub.complete_task(
                    session_id.as_deref(),
                    &msg.task_id,
                    msg.result,
                    CompletionSource::Live,
                );
                if let Err(e) = completed {
                    self.reply_error(e.to_string());
                }
            }
            Inbound::AskPm(msg) => {
                let hub = self.hub.clone();
                let tx = self.tx.clone();
                let session_id = self.resolve(msg.session_id);
                if let Err(e) = parse_optional_session_id(session_id.as_deref()) {
                    let answer = messages::answer(msg.request_id, error_fields(e.to_string()));
                    self.reply(&answer);
                    return;
                }
                // The Brain may be slow; never block this connection's reads on it.
                tokio::spawn(async move {
                    let fields = match hub.ask(session_id.as_deref(), &msg.question, &msg.context).await {
                        Ok(reply) => reply.into_fields(),
                        Err(e) => error_fields(e.to_string()),
                    };
                    let answer = messages::answer(msg.request_id, fields);
                    let _ = tx.send(Outbound::Frame(framing::encode_text(&answer.to_string())));
                });
            }
            Inbound::Checkpoint(msg) => {
                let session_id = self.resolve(msg.session_id);
                let recorded =
                    self.hub
                        .checkpoint(session_id.as_deref(), &msg.task_id, msg.step, msg.state);
                if let Err(e) = recorded {
                    self.reply_error(e.to_string());
                }
            }
            Inbound::Request(msg) => {
                let session_id = self.resolve(msg.session_id);
                if let Err(e) = self.hub.request(session_id.as_deref(), &msg.topic, msg.payload) {
                    self.reply_error(e.to_string());
                }
            }
            Inbound::Unknown => {
                log::debug!("[Live] Ignoring unknown message type on connection {}", self.conn_id);
            }
        }
    }
}

fn error_fields(message: String) -> serde_json::Map<String, Value> {
    let mut fields = serde_json::Map::new();
    fields.insert("error".to_string(), Value::String(message));
    fields
}
