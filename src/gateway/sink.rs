use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{common::types::SessionId, gateway::transport::CloseReason};

/// Everything the gateway reports to the outside, as one tagged value.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Ready { session_id: SessionId, data: Value },
    Resumed,
    Dispatch { event_type: String, data: Value },
    Disconnected { reason: CloseReason },
}

/// Consumer of dispatch events.
///
/// Called inline from the read loop: the next frame is not read until the
/// call returns, so a slow sink throttles the connection.
#[async_trait]
pub trait DispatchSink: Send + Sync + 'static {
    /// Every dispatch except the session markers READY and RESUMED.
    async fn dispatch(&self, event_type: &str, data: Value);

    async fn ready(&self, _session_id: &SessionId, _data: &Value) {}

    async fn resumed(&self) {}

    async fn disconnected(&self, _reason: &CloseReason) {}
}

/// Forwards events into a bounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<GatewayEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<GatewayEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn forward(&self, event: GatewayEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("Dispatch receiver dropped, discarding event");
        }
    }
}

#[async_trait]
impl DispatchSink for ChannelSink {
    async fn dispatch(&self, event_type: &str, data: Value) {
        self.forward(GatewayEvent::Dispatch {
            event_type: event_type.to_string(),
            data,
        })
        .await;
    }

    async fn ready(&self, session_id: &SessionId, data: &Value) {
        self.forward(GatewayEvent::Ready {
            session_id: session_id.clone(),
            data: data.clone(),
        })
        .await;
    }

    async fn resumed(&self) {
        self.forward(GatewayEvent::Resumed).await;
    }

    async fn disconnected(&self, reason: &CloseReason) {
        self.forward(GatewayEvent::Disconnected {
            reason: reason.clone(),
        })
        .await;
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl DispatchSink for NullSink {
    async fn dispatch(&self, _event_type: &str, _data: Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.dispatch("A", Value::Null).await;
        sink.resumed().await;
        sink.dispatch("B", serde_json::json!({"x": 1})).await;

        assert_eq!(
            rx.recv().await,
            Some(GatewayEvent::Dispatch {
                event_type: "A".into(),
                data: Value::Null
            })
        );
        assert_eq!(rx.recv().await, Some(GatewayEvent::Resumed));
        match rx.recv().await {
            Some(GatewayEvent::Dispatch { event_type, data }) => {
                assert_eq!(event_type, "B");
                assert_eq!(data["x"], 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);
        sink.dispatch("A", Value::Null).await;
    }
}
