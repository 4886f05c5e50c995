//! WebSocket plumbing shared by the gateway and voice control sockets:
//! a cloneable text-frame sender and the writer task that drains it.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, stream::SplitSink};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode},
};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, instrument::WithSubscriber, warn};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Time the writer gets to flush a queued close frame on shutdown.
pub const WRITE_TASK_SHUTDOWN_MS: u64 = 500;

/// Cloneable handle that queues frames for the writer task.
///
/// Once closed, every further send is refused.
#[derive(Clone)]
pub(crate) struct SocketSender {
    tx: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl SocketSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            tx,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    /// Returns `false` when the frame was refused.
    pub(crate) fn send_text(&self, text: String) -> bool {
        self.is_open() && self.tx.send(Message::Text(text.into())).is_ok()
    }

    /// Queues a close frame. Only the first call has any effect.
    pub(crate) fn close(&self, code: CloseCode) -> bool {
        if !self.open.swap(false, Ordering::SeqCst) {
            return false;
        }
        let frame = CloseFrame {
            code,
            reason: "".into(),
        };
        let _ = self.tx.send(Message::Close(Some(frame)));
        true
    }

    /// Refuses further sends without queuing a close frame. Returns whether
    /// the sender was still open.
    pub(crate) fn mark_closed(&self) -> bool {
        self.open.swap(false, Ordering::SeqCst)
    }
}

/// The spawned writer half of a socket.
pub(crate) struct SocketWriter {
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl SocketWriter {
    /// Spawns the writer for `sink` and returns it with its sender.
    pub(crate) fn spawn(
        label: &str,
        sink: SplitSink<WsStream, Message>,
        dispatch: &Dispatch,
    ) -> (Self, SocketSender) {
        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            write_loop(label.to_string(), sink, rx, cancel.clone())
                .with_subscriber(dispatch.clone()),
        );
        (
            Self {
                handle: Some(handle),
                cancel,
            },
            SocketSender::new(tx),
        )
    }

    /// Lets the writer flush what is queued, then aborts it if it lingers.
    pub(crate) async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(mut handle) = self.handle.take() {
            let wait = Duration::from_millis(WRITE_TASK_SHUTDOWN_MS);
            if tokio::time::timeout(wait, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }

    pub(crate) fn abort(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for SocketWriter {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn write_loop(
    label: String,
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        // Queued frames win over cancellation so a pending close frame is flushed.
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        let is_close = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            warn!("[{}] WS write error: {}", label, e);
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = write.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_queued_once_then_sends_are_refused() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = SocketSender::new(tx);

        assert!(sender.send_text("a".into()));
        assert!(sender.close(CloseCode::from(4000)));
        assert!(!sender.close(CloseCode::Normal));
        assert!(!sender.send_text("b".into()));

        assert!(matches!(rx.try_recv(), Ok(Message::Text(t)) if t.as_str() == "a"));
        match rx.try_recv() {
            Ok(Message::Close(Some(frame))) => assert_eq!(u16::from(frame.code), 4000),
            other => panic!("expected a close frame, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_writer_closes_the_sender() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = SocketSender::new(tx);
        drop(rx);
        assert!(!sender.is_open());
        assert!(!sender.send_text("x".into()));
    }

    #[test]
    fn mark_closed_reports_the_first_transition() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sender = SocketSender::new(tx);
        assert!(sender.mark_closed());
        assert!(!sender.mark_closed());
        assert!(!sender.close(CloseCode::Normal));
    }
}
