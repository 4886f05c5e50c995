//! One gateway socket: handshake, writer task, frame decoding.
//!
//! The transport never decides whether to reconnect. It reports why it
//! closed and leaves the decision to the session controller.

use futures::{StreamExt, stream::SplitStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{Message, frame::coding::CloseCode},
};
use tracing::{Dispatch, debug, warn};

use crate::{
    common::{
        errors::{GatewayError, GatewayResult},
        socket::{SocketSender, SocketWriter, WsStream},
    },
    gateway::payload::GatewayPayload,
};

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server sent a close frame.
    Remote { code: u16, reason: String },
    /// The stream ended without a close frame.
    StreamEnded,
    Io(String),
    Decode(String),
    /// The heartbeat loop found an unacknowledged heartbeat.
    Zombie,
    /// The server sent RECONNECT.
    ReconnectRequested,
    /// `stop()` was called.
    Stopped,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote { code, reason } => write!(f, "closed by remote ({code}: {reason})"),
            Self::StreamEnded => write!(f, "stream ended"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::Zombie => write!(f, "zombie connection"),
            Self::ReconnectRequested => write!(f, "reconnect requested by server"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Cloneable write handle for the current socket.
///
/// Sending after the socket closed fails with `NotConnected`; frames are
/// never dropped silently.
#[derive(Clone)]
pub struct TransportSender(SocketSender);

impl TransportSender {
    pub fn is_open(&self) -> bool {
        self.0.is_open()
    }

    pub fn send(&self, payload: &GatewayPayload) -> GatewayResult<()> {
        if !self.0.is_open() {
            return Err(GatewayError::NotConnected);
        }
        if self.0.send_text(payload.to_json()?) {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }

    /// Queues a close frame. Only the first call has any effect.
    pub fn close(&self, code: u16) -> bool {
        self.0.close(CloseCode::from(code))
    }
}

pub struct GatewayTransport {
    label: String,
    read: SplitStream<WsStream>,
    sender: TransportSender,
    writer: SocketWriter,
}

impl GatewayTransport {
    /// Performs the WebSocket handshake and spawns the writer task.
    pub async fn connect(url: &str, label: &str, dispatch: &Dispatch) -> GatewayResult<Self> {
        debug!("[{}] Connecting to gateway: {}", label, url);
        let (ws_stream, _) = connect_async(url).await?;
        let (write, read) = ws_stream.split();
        let (writer, sender) = SocketWriter::spawn(label, write, dispatch);

        Ok(Self {
            label: label.to_string(),
            read,
            sender: TransportSender(sender),
            writer,
        })
    }

    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    /// Reads the next payload, skipping control frames.
    ///
    /// Any error ends the connection: the socket is marked closed and the
    /// reason returned.
    pub async fn next_payload(&mut self) -> Result<GatewayPayload, CloseReason> {
        loop {
            let msg = match self.read.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    warn!("[{}] WS read error: {}", self.label, e);
                    return Err(self.release(CloseReason::Io(e.to_string())));
                }
                None => {
                    debug!("[{}] WS stream ended", self.label);
                    return Err(self.release(CloseReason::StreamEnded));
                }
            };

            let decoded = match msg {
                Message::Text(text) => GatewayPayload::from_text(text.as_str()),
                Message::Binary(bin) => GatewayPayload::from_compressed(&bin),
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1000u16, "No reason".into()));
                    return Err(self.release(CloseReason::Remote { code, reason }));
                }
                _ => continue,
            };

            return decoded.map_err(|e| {
                warn!("[{}] Dropping connection on undecodable frame: {}", self.label, e);
                self.release(CloseReason::Decode(e.to_string()))
            });
        }
    }

    fn release(&self, reason: CloseReason) -> CloseReason {
        if self.sender.0.mark_closed() {
            debug!("[{}] Transport closed: {}", self.label, reason);
        }
        reason
    }

    /// Lets the writer flush (e.g. a queued close frame), then drops the socket.
    pub async fn shutdown(mut self) {
        self.sender.0.mark_closed();
        self.writer.shutdown().await;
    }
}

#[cfg(test)]
impl TransportSender {
    pub(crate) fn for_test(tx: tokio::sync::mpsc::UnboundedSender<Message>) -> Self {
        Self(SocketSender::new(tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::payload;
    use tokio::sync::mpsc;

    #[test]
    fn send_after_close_fails_loudly() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = TransportSender::for_test(tx);

        sender.send(&payload::heartbeat(1)).unwrap();
        assert!(sender.close(1000));
        assert!(!sender.close(1000));
        assert!(matches!(
            sender.send(&payload::heartbeat(2)),
            Err(GatewayError::NotConnected)
        ));

        assert!(matches!(rx.try_recv(), Ok(Message::Text(_))));
        assert!(matches!(rx.try_recv(), Ok(Message::Close(Some(_)))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_fails_when_writer_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = TransportSender::for_test(tx);
        drop(rx);
        assert!(!sender.is_open());
        assert!(matches!(
            sender.send(&payload::heartbeat(0)),
            Err(GatewayError::NotConnected)
        ));
    }

    #[test]
    fn close_reason_names_the_remote_code() {
        let r = CloseReason::Remote {
            code: 4004,
            reason: "auth".into(),
        };
        assert_eq!(r.to_string(), "closed by remote (4004: auth)");
    }
}
