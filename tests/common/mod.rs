//! Shared helpers for integration tests: a small in-process MQTT broker and
//! a raw test client, both built on the crate's own codec.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use mqtt_forwarder::codec::{Decoder, Encoder};
use mqtt_forwarder::config::Config;
use mqtt_forwarder::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Subscription,
};
use mqtt_forwarder::topic::topic_matches_filter;

/// How long a test waits for any single expected event
pub const WAIT: Duration = Duration::from_secs(10);

struct ClientEntry {
    id: u64,
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<Packet>,
}

#[derive(Default)]
struct BrokerState {
    next_id: AtomicU64,
    connects: AtomicUsize,
    client_ids: Mutex<Vec<String>>,
    clients: Mutex<Vec<ClientEntry>>,
    rejected_filters: Mutex<Vec<String>>,
}

impl BrokerState {
    fn route(&self, topic: &str, payload: &Bytes) {
        for client in self.clients.lock().unwrap().iter() {
            if client
                .filters
                .iter()
                .any(|filter| topic_matches_filter(topic, filter))
            {
                let _ = client.tx.send(Packet::Publish(Publish::at_most_once(
                    topic,
                    payload.clone(),
                )));
            }
        }
    }
}

/// Minimal MQTT v3.1.1 broker: CONNECT, SUBSCRIBE, PUBLISH routing, PING
pub struct TestBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestBroker {
    /// Start on an ephemeral port
    pub async fn start() -> Self {
        Self::start_on(0).await
    }

    /// Start on a specific port (0 for ephemeral)
    pub async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("Failed to bind test broker");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BrokerState::default());
        let token = CancellationToken::new();

        let handle = tokio::spawn(accept_loop(listener, state.clone(), token.clone()));

        Self {
            addr,
            state,
            token,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("mqtt://{}", self.addr)
    }

    /// Number of accepted CONNECTs
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.state.client_ids.lock().unwrap().clone()
    }

    /// Answer SUBSCRIBE for `filter` with a failure return code
    pub fn reject_filter(&self, filter: &str) {
        self.state
            .rejected_filters
            .lock()
            .unwrap()
            .push(filter.to_string());
    }

    /// Number of connected clients with at least one active subscription
    pub fn subscriber_count(&self) -> usize {
        self.state
            .clients
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.filters.is_empty())
            .count()
    }

    /// Wait until `count` clients hold a subscription
    pub async fn wait_for_subscribers(&self, count: usize) {
        timeout(WAIT, async {
            while self.subscriber_count() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Timed out waiting for subscribers");
    }

    /// Wait until at least `count` CONNECTs were accepted
    pub async fn wait_for_connects(&self, count: usize) {
        timeout(WAIT, async {
            while self.connects() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Timed out waiting for connects");
    }

    /// Shut the broker down, dropping every client connection
    pub async fn stop(self) -> SocketAddr {
        self.token.cancel();
        let _ = self.handle.await;
        self.addr
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<BrokerState>, token: CancellationToken) {
    let mut connections = Vec::new();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.push(tokio::spawn(handle_connection(
                        stream,
                        state.clone(),
                        token.clone(),
                    )));
                }
                Err(_) => break,
            },
        }
    }

    for connection in connections {
        let _ = connection.await;
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<BrokerState>, token: CancellationToken) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();

    let writer_task = tokio::spawn(async move {
        let encoder = Encoder::new();
        let mut buf = BytesMut::new();
        while let Some(packet) = rx.recv().await {
            buf.clear();
            if encoder.encode(&packet, &mut buf).is_err() {
                break;
            }
            if writer.write_all(&buf).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    let decoder = Decoder::new();
    let mut buf = BytesMut::with_capacity(4096);

    'conn: loop {
        loop {
            let (packet, consumed) = match decoder.decode(&buf) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(_) => break 'conn,
            };
            buf.advance(consumed);

            match packet {
                Packet::Connect(connect) => {
                    state.connects.fetch_add(1, Ordering::SeqCst);
                    state
                        .client_ids
                        .lock()
                        .unwrap()
                        .push(connect.client_id.clone());
                    state.clients.lock().unwrap().push(ClientEntry {
                        id,
                        filters: Vec::new(),
                        tx: tx.clone(),
                    });
                    let _ = tx.send(Packet::ConnAck(ConnAck {
                        session_present: false,
                        return_code: ConnectReturnCode::Accepted,
                    }));
                }
                Packet::Subscribe(subscribe) => {
                    let rejected = state.rejected_filters.lock().unwrap().clone();
                    let mut return_codes = Vec::new();
                    let mut clients = state.clients.lock().unwrap();
                    for sub in subscribe.subscriptions {
                        if rejected.contains(&sub.filter) {
                            return_codes.push(SubscribeReturnCode::Failure);
                            continue;
                        }
                        if let Some(client) = clients.iter_mut().find(|c| c.id == id) {
                            client.filters.push(sub.filter);
                        }
                        return_codes.push(SubscribeReturnCode::Granted(QoS::AtMostOnce));
                    }
                    drop(clients);
                    let _ = tx.send(Packet::SubAck(SubAck {
                        packet_id: subscribe.packet_id,
                        return_codes,
                    }));
                }
                Packet::Publish(publish) => {
                    if let Some(packet_id) = publish.packet_id {
                        let _ = tx.send(Packet::PubAck(PubAck { packet_id }));
                    }
                    state.route(&publish.topic, &publish.payload);
                }
                Packet::PingReq => {
                    let _ = tx.send(Packet::PingResp);
                }
                Packet::Disconnect => break 'conn,
                _ => {}
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read_buf(&mut buf) => match read {
                Ok(n) if n > 0 => {}
                _ => break,
            },
        }
    }

    state.clients.lock().unwrap().retain(|c| c.id != id);
    drop(tx);
    writer_task.abort();
}

/// Raw MQTT client for driving a broker from tests
pub struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
}

impl TestClient {
    /// Connect and complete the CONNECT/CONNACK handshake
    pub async fn connect(addr: SocketAddr, client_id: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        let mut client = Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            buf: BytesMut::new(),
        };

        client
            .send(&Packet::Connect(Box::new(Connect {
                client_id: client_id.to_string(),
                ..Default::default()
            })))
            .await;
        match client.recv().await {
            Some(Packet::ConnAck(connack)) => {
                assert_eq!(connack.return_code, ConnectReturnCode::Accepted)
            }
            other => panic!("Expected CONNACK, got {:?}", other),
        }
        client
    }

    pub async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder
            .encode(packet, &mut buf)
            .expect("Failed to encode");
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    /// Next packet, or None after the wait elapses or the broker closes
    pub async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(WAIT).await
    }

    pub async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        timeout(wait, async {
            loop {
                if let Some((packet, n)) = self.decoder.decode(&self.buf).ok()? {
                    self.buf.advance(n);
                    return Some(packet);
                }
                match self.stream.read_buf(&mut self.buf).await {
                    Ok(n) if n > 0 => {}
                    _ => return None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn subscribe(&mut self, filter: &str) {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id: 1,
            subscriptions: vec![Subscription {
                filter: filter.to_string(),
                qos: QoS::AtMostOnce,
            }],
        }))
        .await;
        match self.recv().await {
            Some(Packet::SubAck(suback)) => assert!(!suback.has_failure()),
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    pub async fn publish(&mut self, topic: &str, payload: &'static [u8]) {
        self.send(&Packet::Publish(Publish::at_most_once(
            topic,
            Bytes::from_static(payload),
        )))
        .await;
    }

    /// Next application message as (topic, payload)
    pub async fn recv_publish(&mut self) -> Option<(String, Bytes)> {
        loop {
            match self.recv().await? {
                Packet::Publish(publish) => return Some((publish.topic, publish.payload)),
                _ => continue,
            }
        }
    }
}

/// Forwarder config pointing at two test brokers
pub fn forwarder_config(local: &str, remote: &str) -> Config {
    Config::parse(&format!(
        r#"
[local]
url = "{}"
client_id = "forwarder-local"

[remote]
url = "{}"
client_id = "forwarder-remote"
topic_prefix = "bridge/siteA"

[reconnect]
initial_delay_ms = 100
max_delay_ms = 1000
connect_timeout_secs = 5
"#,
        local, remote
    ))
    .expect("valid test config")
}

/// A broker that accepts one client, answers its CONNECT and then never
/// reads from the socket again
pub async fn spawn_unread_broker() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("mqtt://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let decoder = Decoder::new();
        let mut buf = BytesMut::new();
        loop {
            if let Some((Packet::Connect(_), _)) = decoder.decode(&buf).unwrap() {
                break;
            }
            if stream.read_buf(&mut buf).await.unwrap() == 0 {
                return;
            }
        }

        let mut out = BytesMut::new();
        Encoder::new()
            .encode(
                &Packet::ConnAck(ConnAck {
                    session_present: false,
                    return_code: ConnectReturnCode::Accepted,
                }),
                &mut out,
            )
            .unwrap();
        stream.write_all(&out).await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(stream);
    });

    (url, handle)
}
