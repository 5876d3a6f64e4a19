//! Broker Client
//!
//! A minimal MQTT v3.1.1 client used for both sides of the bridge. The
//! connection lifecycle (retry, backoff, shutdown) is not handled here: a
//! [`Connector`] opens exactly one session per call and never reconnects on
//! its own. The traits keep the lifecycle code independent of the transport
//! so it can be exercised with scripted sessions.

mod error;
mod tcp;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::EndpointConfig;
use crate::protocol::QoS;

pub use error::{ConnectionError, PublishError, SubscriptionError};
pub use tcp::{MqttSession, TcpConnector};

/// A message received from the subscribed broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Something that happened on a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Application message delivered by the broker
    Message(InboundMessage),
    /// Answer to a SUBSCRIBE; `granted` is None when the broker refused it
    SubAck {
        packet_id: u16,
        granted: Option<QoS>,
    },
    /// QoS 1 publish acknowledged
    PubAck { packet_id: u16 },
    /// Keep-alive answered
    PingResp,
}

/// Opens broker sessions
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect and complete the MQTT handshake with a clean session
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Box<dyn Session>, ConnectionError>;
}

/// One established broker connection
#[async_trait]
pub trait Session: Send {
    /// Send SUBSCRIBE for one filter, returning its packet identifier.
    /// The outcome arrives later as [`SessionEvent::SubAck`].
    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<u16, SubscriptionError>;

    /// Write a PUBLISH packet
    async fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), PublishError>;

    /// Send PINGREQ
    async fn ping(&mut self) -> Result<(), ConnectionError>;

    /// Wait for the next event. Must be cancel safe: it is raced against
    /// commands and timers, and a cancelled call must not lose data.
    async fn poll(&mut self) -> Result<SessionEvent, ConnectionError>;

    /// Best-effort DISCONNECT followed by closing the transport
    async fn disconnect(&mut self);
}
