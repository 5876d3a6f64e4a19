//! Plain TCP broker sessions

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::{
    ConnectionError, Connector, InboundMessage, PublishError, Session, SessionEvent,
    SubscriptionError,
};
use crate::codec::{Decoder, Encoder};
use crate::config::EndpointConfig;
use crate::protocol::{
    ConnectReturnCode, Connect, Packet, Publish, QoS, SubscribeReturnCode, Subscribe, Subscription,
};

/// Initial read buffer capacity
const READ_BUFFER_SIZE: usize = 4096;

/// Opens MQTT sessions over plain TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Box<dyn Session>, ConnectionError> {
        // TCP connect and the CONNACK wait share one deadline
        let session = timeout(endpoint.connect_timeout, MqttSession::connect(endpoint))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        Ok(Box::new(session))
    }
}

/// A connected MQTT v3.1.1 session
pub struct MqttSession {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Bound on a single packet write; a peer that stops reading is a lost connection
    write_timeout: Duration,
    next_packet_id: u16,
}

impl MqttSession {
    /// Open the socket, send CONNECT and wait for an accepting CONNACK
    pub async fn connect(endpoint: &EndpointConfig) -> Result<Self, ConnectionError> {
        let stream = TcpStream::connect(endpoint.address()).await?;
        stream.set_nodelay(true)?;

        debug!("{}: TCP connected", endpoint.url);

        let mut session = Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new().with_max_packet_size(endpoint.max_packet_size),
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            write_timeout: endpoint.connect_timeout,
            next_packet_id: 1,
        };

        let connect = Packet::Connect(Box::new(Connect {
            client_id: endpoint.client_id.clone(),
            clean_session: true,
            keep_alive: endpoint.keep_alive,
            username: endpoint.username.clone(),
            password: endpoint
                .password
                .as_ref()
                .map(|p| Bytes::copy_from_slice(p.expose().as_bytes())),
        }));
        session.send(&connect).await?;

        debug!("{}: CONNECT sent", endpoint.url);

        match session.read_packet().await? {
            Packet::ConnAck(connack) => {
                if connack.return_code != ConnectReturnCode::Accepted {
                    return Err(ConnectionError::Rejected(connack.return_code));
                }
                debug!(
                    "{}: CONNACK received (session_present={})",
                    endpoint.url, connack.session_present
                );
            }
            other => {
                return Err(ConnectionError::Protocol(format!(
                    "expected CONNACK, got {:?}",
                    other.packet_type()
                )));
            }
        }

        Ok(session)
    }

    fn allocate_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        id
    }

    /// Encode and write one packet
    async fn send(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.flush_write_buf().await?;
        Ok(())
    }

    /// Write `write_buf` out, giving up after `write_timeout`
    async fn flush_write_buf(&mut self) -> io::Result<()> {
        match timeout(self.write_timeout, self.stream.write_all(&self.write_buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write stalled for {:?}", self.write_timeout),
            )),
        }
    }

    /// Read until one full packet is buffered.
    ///
    /// Only `read_buf` is awaited, and partial data stays in `self.read_buf`,
    /// so dropping this future never loses bytes.
    async fn read_packet(&mut self) -> Result<Packet, ConnectionError> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(consumed);
                return Ok(packet);
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Closed);
            }
        }
    }
}

#[async_trait]
impl Session for MqttSession {
    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<u16, SubscriptionError> {
        let packet_id = self.allocate_packet_id();
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                filter: filter.to_string(),
                qos,
            }],
        });

        self.write_buf.clear();
        self.encoder.encode(&subscribe, &mut self.write_buf)?;
        self.flush_write_buf().await?;
        Ok(packet_id)
    }

    async fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), PublishError> {
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(self.allocate_packet_id()),
        };
        let publish = Packet::Publish(Publish {
            dup: false,
            qos,
            retain: false,
            topic: topic.to_string(),
            packet_id,
            payload,
        });

        self.write_buf.clear();
        self.encoder.encode(&publish, &mut self.write_buf)?;
        self.flush_write_buf().await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), ConnectionError> {
        self.send(&Packet::PingReq).await
    }

    async fn poll(&mut self) -> Result<SessionEvent, ConnectionError> {
        loop {
            let event = match self.read_packet().await? {
                Packet::Publish(publish) => {
                    SessionEvent::Message(InboundMessage::new(publish.topic, publish.payload))
                }
                Packet::SubAck(suback) => SessionEvent::SubAck {
                    packet_id: suback.packet_id,
                    granted: match suback.return_codes.first() {
                        Some(SubscribeReturnCode::Granted(qos)) => Some(*qos),
                        _ => None,
                    },
                },
                Packet::PubAck(puback) => SessionEvent::PubAck {
                    packet_id: puback.packet_id,
                },
                Packet::PingResp => SessionEvent::PingResp,
                Packet::ConnAck(_) => {
                    return Err(ConnectionError::Protocol(
                        "unexpected CONNACK on established session".to_string(),
                    ))
                }
                other => {
                    trace!("Ignoring {:?} from broker", other.packet_type());
                    continue;
                }
            };
            return Ok(event);
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.send(&Packet::Disconnect).await {
            trace!("DISCONNECT not delivered: {}", e);
        }
        let _ = self.stream.shutdown().await;
    }
}
