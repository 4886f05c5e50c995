use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    ConnectionState, GatewayShared,
    constants::{READY_EVENT, RESUMABLE_CLOSE_CODE, RESUMED_EVENT},
    opcodes::OpCode,
    payload::{self, GatewayPayload},
    session::SessionRecord,
    transport::{CloseReason, TransportSender},
};
use crate::common::types::SessionId;

/// How one connection ended, as seen by the reconnect loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionOutcome {
    /// Unplanned drop; reconnect after backoff.
    Dropped(CloseReason),
    /// Server sent RECONNECT; reconnect without waiting.
    ReconnectNow,
    /// `stop()` was requested.
    Stopped,
}

/// Opcode handling for one socket.
///
/// Frames are handled strictly in arrival order; a frame's sequence number
/// is recorded before anything else looks at it.
pub(crate) struct ConnectionHandler {
    shared: Arc<GatewayShared>,
    sender: TransportSender,
    active_since: Option<Instant>,
}

impl ConnectionHandler {
    pub(crate) fn new(shared: Arc<GatewayShared>, sender: TransportSender) -> Self {
        Self {
            shared,
            sender,
            active_since: None,
        }
    }

    /// When this connection reached Active, if it did.
    pub(crate) fn active_since(&self) -> Option<Instant> {
        self.active_since
    }

    pub(crate) async fn handle(&mut self, payload: GatewayPayload) -> Option<SessionOutcome> {
        if let Some(seq) = payload.s {
            self.shared.session.observe_sequence(seq);
        }

        let Some(op) = payload.opcode() else {
            debug!("[{}] Ignoring unknown op {}", self.shared.label, payload.op);
            return None;
        };

        match op {
            OpCode::Hello => self.handle_hello(&payload),
            OpCode::Dispatch => {
                self.handle_dispatch(payload).await;
                None
            }
            OpCode::Heartbeat => {
                debug!("[{}] Server requested a heartbeat", self.shared.label);
                let seq = self.shared.session.heartbeat_sequence();
                self.send(&payload::heartbeat(seq));
                None
            }
            OpCode::HeartbeatAck => {
                self.shared.heartbeat.acknowledge();
                None
            }
            OpCode::Reconnect => {
                info!("[{}] Server requested a reconnect", self.shared.label);
                self.shared.session.suspend();
                self.sender.close(RESUMABLE_CLOSE_CODE);
                Some(SessionOutcome::ReconnectNow)
            }
            OpCode::InvalidSession => {
                warn!(
                    "[{}] Session invalidated by server, identifying again",
                    self.shared.label
                );
                self.shared.session.invalidate();
                self.identify();
                None
            }
            client_op => {
                debug_assert!(client_op.is_client_only());
                warn!(
                    "[{}] Server sent client-only op {:?}, ignoring",
                    self.shared.label, client_op
                );
                None
            }
        }
    }

    fn handle_hello(&mut self, payload: &GatewayPayload) -> Option<SessionOutcome> {
        let Some(interval) = payload.heartbeat_interval() else {
            return Some(SessionOutcome::Dropped(CloseReason::Decode(
                "HELLO without heartbeat_interval".into(),
            )));
        };
        debug!(
            "[{}] Hello received, heartbeat interval {:?}",
            self.shared.label, interval
        );

        // Armed before IDENTIFY/RESUME so the server sees beats during replay.
        self.shared.heartbeat.reset_ack();
        self.shared
            .heartbeat
            .start(interval, Arc::clone(&self.shared));

        match self.shared.session.take_resume() {
            Some((session_id, seq)) => self.resume(&session_id, seq),
            None => self.identify(),
        }
        None
    }

    fn identify(&mut self) {
        self.shared.session.clear_suspension();
        self.shared.set_state(ConnectionState::Identifying);
        debug!("[{}] Sending IDENTIFY", self.shared.label);
        let frame = payload::identify(&self.shared.credentials, &self.shared.config);
        self.send(&frame);
    }

    fn resume(&mut self, session_id: &SessionId, seq: u64) {
        self.shared.set_state(ConnectionState::Resuming);
        debug!(
            "[{}] Resuming session {} at sequence {}",
            self.shared.label, session_id, seq
        );
        let frame = payload::resume(&self.shared.credentials, session_id, seq);
        self.send(&frame);
    }

    async fn handle_dispatch(&mut self, payload: GatewayPayload) {
        let Some(event_type) = payload.t else {
            warn!("[{}] Dispatch without event type", self.shared.label);
            return;
        };

        match event_type.as_str() {
            READY_EVENT => self.handle_ready(payload.d).await,
            RESUMED_EVENT => {
                info!("[{}] Session resumed", self.shared.label);
                self.activate();
                self.shared.sink.resumed().await;
            }
            _ => self.shared.sink.dispatch(&event_type, payload.d).await,
        }
    }

    async fn handle_ready(&mut self, data: Value) {
        let Some(session_id) = data["session_id"].as_str().map(SessionId::from) else {
            warn!("[{}] READY without session_id", self.shared.label);
            return;
        };
        info!(
            "[{}] Ready, session {}",
            self.shared.label, session_id
        );
        self.shared
            .session
            .replace(SessionRecord::new(session_id.clone()));
        self.activate();
        self.shared.sink.ready(&session_id, &data).await;
    }

    fn activate(&mut self) {
        self.active_since.get_or_insert_with(Instant::now);
        self.shared.set_state(ConnectionState::Active);
    }

    fn send(&self, frame: &GatewayPayload) {
        if let Err(e) = self.sender.send(frame) {
            warn!(
                "[{}] Failed to send {}: {}",
                self.shared.label, frame, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message;

    use super::*;
    use crate::{
        configs::GatewayConfig,
        gateway::{identity::Credentials, sink::DispatchSink},
    };

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DispatchSink for RecordingSink {
        async fn dispatch(&self, event_type: &str, _data: Value) {
            self.events.lock().unwrap().push(event_type.to_string());
        }

        async fn ready(&self, session_id: &SessionId, _data: &Value) {
            self.events.lock().unwrap().push(format!("ready:{session_id}"));
        }

        async fn resumed(&self) {
            self.events.lock().unwrap().push("resumed".into());
        }
    }

    struct Harness {
        shared: Arc<GatewayShared>,
        sink: Arc<RecordingSink>,
        handler: ConnectionHandler,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl Harness {
        fn new() -> Self {
            let sink = Arc::new(RecordingSink::default());
            let shared = Arc::new(GatewayShared::new(
                GatewayConfig::default(),
                Credentials::new("token"),
                sink.clone(),
                tracing::Dispatch::none(),
            ));
            let (handler, rx) = Self::connect(&shared);
            Self {
                shared,
                sink,
                handler,
                rx,
            }
        }

        fn connect(
            shared: &Arc<GatewayShared>,
        ) -> (ConnectionHandler, mpsc::UnboundedReceiver<Message>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let sender = TransportSender::for_test(tx);
            shared.attach(sender.clone());
            (ConnectionHandler::new(shared.clone(), sender), rx)
        }

        /// Simulates a fresh socket for the same session.
        fn reconnect(&mut self) {
            self.shared.detach();
            let (handler, rx) = Self::connect(&self.shared);
            self.handler = handler;
            self.rx = rx;
        }

        async fn feed(&mut self, raw: Value) -> Option<SessionOutcome> {
            let payload: GatewayPayload = serde_json::from_value(raw).unwrap();
            self.handler.handle(payload).await
        }

        fn sent(&mut self) -> Vec<GatewayPayload> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                if let Message::Text(text) = msg {
                    out.push(GatewayPayload::from_text(text.as_str()).unwrap());
                }
            }
            out
        }

        async fn ready(&mut self, id: &str) {
            self.feed(json!({"op": 10, "d": {"heartbeat_interval": 41250}}))
                .await;
            self.feed(json!({"op": 0, "s": 1, "t": "READY", "d": {"session_id": id}}))
                .await;
            self.sent();
        }
    }

    #[tokio::test]
    async fn hello_without_session_identifies() {
        let mut h = Harness::new();
        let outcome = h
            .feed(json!({"op": 10, "d": {"heartbeat_interval": 41250}}))
            .await;
        assert_eq!(outcome, None);

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode(), Some(OpCode::Identify));
        assert_eq!(sent[0].d["token"], "token");
        assert!(h.shared.heartbeat.is_running());
        assert_eq!(
            h.shared.heartbeat.interval(),
            std::time::Duration::from_millis(41_250)
        );
        assert_eq!(h.shared.state(), ConnectionState::Identifying);

        h.feed(json!({"op": 0, "s": 1, "t": "READY", "d": {"session_id": "abc123"}}))
            .await;
        let record = h.shared.session.snapshot().unwrap();
        assert_eq!(&**record.session_id(), "abc123");
        assert_eq!(record.sequence(), 0);
        assert!(!record.is_suspended());
        assert_eq!(h.shared.state(), ConnectionState::Active);
        assert!(h.handler.active_since().is_some());
        assert_eq!(*h.sink.events.lock().unwrap(), vec!["ready:abc123"]);
    }

    #[tokio::test]
    async fn dropped_session_resumes_with_last_sequence() {
        let mut h = Harness::new();
        h.ready("abc123").await;
        h.feed(json!({"op": 0, "s": 57, "t": "MESSAGE_CREATE", "d": {}}))
            .await;

        h.shared.session.suspend();
        let record = h.shared.session.snapshot().unwrap();
        assert!(record.is_suspended());
        assert!(!record.is_invalid());

        h.reconnect();
        h.feed(json!({"op": 10, "d": {"heartbeat_interval": 41250}}))
            .await;
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode(), Some(OpCode::Resume));
        assert_eq!(sent[0].d["session_id"], "abc123");
        assert_eq!(sent[0].d["seq"], 57);
        assert_eq!(h.shared.state(), ConnectionState::Resuming);

        h.feed(json!({"op": 0, "s": 58, "t": "RESUMED", "d": {}}))
            .await;
        assert_eq!(h.shared.state(), ConnectionState::Active);
        assert_eq!(
            *h.sink.events.lock().unwrap(),
            vec!["ready:abc123", "MESSAGE_CREATE", "resumed"]
        );
    }

    #[tokio::test]
    async fn invalid_session_identifies_immediately() {
        let mut h = Harness::new();
        h.ready("abc123").await;

        let outcome = h.feed(json!({"op": 9, "d": false})).await;
        assert_eq!(outcome, None);
        assert!(h.shared.session.snapshot().unwrap().is_invalid());

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode(), Some(OpCode::Identify));
    }

    #[tokio::test]
    async fn invalid_suspended_session_never_resumes() {
        let mut h = Harness::new();
        h.ready("abc123").await;
        h.shared.session.suspend();
        h.shared.session.invalidate();

        h.reconnect();
        h.feed(json!({"op": 10, "d": {"heartbeat_interval": 1000}}))
            .await;
        let sent = h.sent();
        assert_eq!(sent[0].opcode(), Some(OpCode::Identify));
        assert!(!h.shared.session.is_suspended());
    }

    #[tokio::test]
    async fn reconnect_op_suspends_and_closes() {
        let mut h = Harness::new();
        h.ready("abc123").await;

        let outcome = h.feed(json!({"op": 7, "d": null})).await;
        assert_eq!(outcome, Some(SessionOutcome::ReconnectNow));
        assert!(h.shared.session.snapshot().unwrap().should_resume());
        assert!(matches!(
            h.rx.try_recv(),
            Ok(Message::Close(Some(frame))) if u16::from(frame.code) == RESUMABLE_CLOSE_CODE
        ));
    }

    #[tokio::test]
    async fn sequence_is_recorded_before_dispatch() {
        let mut h = Harness::new();
        h.ready("abc123").await;
        for s in [3, 5, 9, 14] {
            h.feed(json!({"op": 0, "s": s, "t": "TYPING_START", "d": {}}))
                .await;
        }
        h.feed(json!({"op": 1, "d": null})).await;

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode(), Some(OpCode::Heartbeat));
        assert_eq!(sent[0].d, json!(14));
    }

    #[tokio::test]
    async fn acks_and_unexpected_ops_send_nothing() {
        let mut h = Harness::new();
        assert_eq!(h.feed(json!({"op": 11})).await, None);
        assert_eq!(h.feed(json!({"op": 42, "d": {}})).await, None);
        assert_eq!(h.feed(json!({"op": 2, "d": {}})).await, None);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_op_is_ignored_but_sequence_counts() {
        let mut h = Harness::new();
        h.ready("abc123").await;
        let payload =
            GatewayPayload::from_text(r#"{"op":300,"d":{"x":1},"s":5,"t":"FUTURE"}"#).unwrap();
        assert_eq!(h.handler.handle(payload).await, None);
        assert!(h.sent().is_empty());
        assert_eq!(h.shared.session.snapshot().unwrap().sequence(), 5);
        assert!(h.sink.events.lock().unwrap().iter().all(|e| e != "FUTURE"));
    }

    #[tokio::test]
    async fn hello_without_interval_drops_the_connection() {
        let mut h = Harness::new();
        let outcome = h.feed(json!({"op": 10, "d": {}})).await;
        assert!(matches!(
            outcome,
            Some(SessionOutcome::Dropped(CloseReason::Decode(_)))
        ));
    }
}
