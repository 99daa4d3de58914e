//! The duplex JSON message contract between the core and a subscriber,
//! independent of transport. The gateway binary adapts an `axum` WebSocket
//! to [`SubscriberSink`]; the core never names `axum` itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Message sent from a subscriber to the core.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Pointer move with an explicit button mask.
    Pointer {
        x: i32,
        y: i32,
        #[serde(rename = "buttonMask")]
        button_mask: u8,
    },
    /// A keyboard key transition.
    Key { key: String, down: bool },
    /// Request a full, non-incremental frame.
    RequestFullFrame,
}

/// Message sent from the core to a subscriber.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Sent once, immediately after a subscriber attaches.
    Connected { width: u16, height: u16 },
    /// A full-frame image, base64-encoded.
    Frame { x: u16, y: u16, data: String },
    /// A coalesced delta image, base64-encoded.
    Update { x: u16, y: u16, data: String },
    /// The session could not be established; the channel should then close.
    Error { message: String },
}

/// Abstracts sending a message to one subscriber over whatever transport the
/// gateway binary wires up.
#[async_trait]
pub trait SubscriberSink: Send + Sync {
    /// Sends `msg` to this subscriber. An error means the subscriber is
    /// gone; callers remove it from the broadcaster's subscriber set.
    async fn send(&self, msg: OutboundMessage) -> Result<(), SinkError>;
}

/// Opaque failure to deliver a message to a subscriber.
#[derive(Debug, thiserror::Error)]
#[error("subscriber channel closed")]
pub struct SinkError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_pointer_message_deserializes() {
        let json = r#"{"type":"pointer","x":10,"y":20,"buttonMask":1}"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        match msg {
            InboundMessage::Pointer { x, y, button_mask } => {
                assert_eq!((x, y, button_mask), (10, 20, 1));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn inbound_request_full_frame_deserializes() {
        let json = r#"{"type":"request_full_frame"}"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, InboundMessage::RequestFullFrame));
    }

    #[test]
    fn outbound_connected_serializes_with_tag() {
        let msg = OutboundMessage::Connected { width: 1600, height: 900 };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"connected","width":1600,"height":900}"#);
    }

    #[test]
    fn outbound_frame_serializes_with_tag() {
        let msg = OutboundMessage::Frame { x: 0, y: 0, data: "abcd".to_string() };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"frame","x":0,"y":0,"data":"abcd"}"#);
    }
}
