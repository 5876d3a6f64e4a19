//! Connection lifecycle for one side of the bridge
//!
//! Each [`ConnectionManager`] owns a single broker connection and runs it in
//! its own task: connect, subscribe (local side), serve publishes and
//! keep-alive, and on any failure schedule a reconnect with exponential
//! backoff. The two managers share nothing except the shutdown token.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backoff::BackoffStrategy;
use crate::client::{
    ConnectionError, Connector, InboundMessage, PublishError, Session, SessionEvent,
    SubscriptionError,
};
use crate::config::EndpointConfig;
use crate::protocol::QoS;

/// Capacity of the publish command queue of one manager
const COMMAND_QUEUE_SIZE: usize = 1000;

/// How long a shutdown waits for DISCONNECT to reach the broker
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Which broker a manager talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Local,
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => write!(f, "Local"),
            Side::Remote => write!(f, "Remote"),
        }
    }
}

/// What a manager does once connected
#[derive(Debug, Clone)]
pub enum Role {
    /// Subscribe to `filter` on every connect and hand messages to `inbound`
    Local {
        filter: String,
        inbound: mpsc::Sender<InboundMessage>,
    },
    /// Publish target; forwarded messages go out with `qos`
    Remote { qos: QoS },
}

impl Role {
    pub fn side(&self) -> Side {
        match self {
            Role::Local { .. } => Side::Local,
            Role::Remote { .. } => Side::Remote,
        }
    }

    fn publish_qos(&self) -> QoS {
        match self {
            Role::Local { .. } => QoS::AtMostOnce,
            Role::Remote { qos } => *qos,
        }
    }
}

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::ReconnectScheduled => write!(f, "reconnect scheduled"),
        }
    }
}

/// Commands sent to the connection task
#[derive(Debug)]
enum Command {
    Publish {
        topic: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<(), PublishError>>,
    },
}

impl Command {
    fn reject(self, error: PublishError) {
        match self {
            Command::Publish { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Cloneable publish handle onto a manager.
///
/// The connected check reads the watch channel and never waits on the
/// connection task.
#[derive(Debug, Clone)]
pub struct Publisher {
    side: Side,
    state: watch::Receiver<ConnectionState>,
    commands: mpsc::Sender<Command>,
}

impl Publisher {
    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    /// Publish one message. Fails immediately unless the side is connected.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: Bytes,
    ) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }

        let (reply, rx) = oneshot::channel();
        self.commands
            .try_send(Command::Publish {
                topic: topic.into(),
                payload,
                reply,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => PublishError::QueueFull,
                TrySendError::Closed(_) => PublishError::Closed,
            })?;

        rx.await.map_err(|_| PublishError::Closed)?
    }
}

/// Owns one broker connection and its reconnect loop
pub struct ConnectionManager {
    side: Side,
    url: String,
    state: watch::Receiver<ConnectionState>,
    commands: mpsc::Sender<Command>,
    token: CancellationToken,
    pending: Option<ConnectionTask>,
    handle: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Build a manager. Nothing happens until [`start`](Self::start).
    ///
    /// `token` is normally a child of the bridge's shutdown token so that
    /// cancelling the parent stops every side.
    pub fn new(
        role: Role,
        endpoint: EndpointConfig,
        backoff: BackoffStrategy,
        connector: Arc<dyn Connector>,
        token: CancellationToken,
    ) -> Self {
        let side = role.side();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);

        let url = endpoint.url.clone();
        let task = ConnectionTask {
            side,
            role,
            endpoint,
            connector,
            backoff,
            state: state_tx,
            commands: command_rx,
            token: token.clone(),
        };

        Self {
            side,
            url,
            state: state_rx,
            commands: command_tx,
            token,
            pending: Some(task),
            handle: None,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Spawn the connection task. Later calls do nothing.
    pub fn start(&mut self) {
        let Some(task) = self.pending.take() else {
            debug!("{} broker: connection manager already started", self.side);
            return;
        };

        info!("{} broker: starting connection to {}", self.side, self.url);
        self.handle = Some(tokio::spawn(task.run()));
    }

    /// Disconnect and stop reconnecting.
    ///
    /// Returns once the connection task has exited, so no connect attempt
    /// can begin afterwards. Safe to call in any state and more than once.
    pub async fn stop(&mut self) {
        self.token.cancel();
        // A never-started task is dropped so it cannot be started later
        self.pending = None;

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("{} broker: connection task failed: {}", self.side, e);
            }
        }
    }

    /// Publish one message through this side
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: Bytes,
    ) -> Result<(), PublishError> {
        self.publisher().publish(topic, payload).await
    }

    pub fn publisher(&self) -> Publisher {
        Publisher {
            side: self.side,
            state: self.state.clone(),
            commands: self.commands.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch receiver for state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("side", &self.side)
            .field("url", &self.url)
            .field("state", &self.state())
            .field("started", &self.handle.is_some())
            .finish()
    }
}

/// Why a connected session ended
enum SessionEnd {
    Shutdown,
    Lost(ConnectionError),
}

/// One iteration of the connected loop
enum Step {
    Shutdown,
    Command(Command),
    Event(Result<SessionEvent, ConnectionError>),
    KeepAlive,
}

/// State confined to the spawned task
struct ConnectionTask {
    side: Side,
    role: Role,
    endpoint: EndpointConfig,
    connector: Arc<dyn Connector>,
    backoff: BackoffStrategy,
    state: watch::Sender<ConnectionState>,
    commands: mpsc::Receiver<Command>,
    token: CancellationToken,
}

impl ConnectionTask {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn run(mut self) {
        while !self.token.is_cancelled() {
            self.set_state(ConnectionState::Connecting);
            info!("{} broker: connecting to {}", self.side, self.endpoint.url);

            let error = match self.establish().await {
                None => break,
                Some(Ok(session)) => {
                    self.backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    info!("{} broker: connected to {}", self.side, self.endpoint.url);

                    match self.serve(session).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(e) => e,
                    }
                }
                Some(Err(e)) => e,
            };

            warn!("{} broker: connection error: {}", self.side, error);
            info!("{} broker: connection closed", self.side);
            self.set_state(ConnectionState::Disconnected);

            let delay = self.backoff.next_delay();
            self.set_state(ConnectionState::ReconnectScheduled);
            info!(
                "{} broker: reconnecting in {}ms (attempt {})",
                self.side,
                delay.as_millis(),
                self.backoff.attempt()
            );

            if !self.wait(delay).await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("{} broker: connection manager stopped", self.side);
    }

    /// Connect, rejecting publishes meanwhile. None when shut down.
    async fn establish(&mut self) -> Option<Result<Box<dyn Session>, ConnectionError>> {
        let connect = self.connector.connect(&self.endpoint);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                result = &mut connect => return Some(result),
                Some(command) = self.commands.recv() => {
                    debug!("{} broker: rejecting publish while not connected", self.side);
                    command.reject(PublishError::NotConnected);
                }
            }
        }
    }

    /// Sleep out a reconnect delay. False when shut down first.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return false,
                _ = &mut sleep => return true,
                Some(command) = self.commands.recv() => {
                    debug!("{} broker: rejecting publish while not connected", self.side);
                    command.reject(PublishError::NotConnected);
                }
            }
        }
    }

    async fn serve(&mut self, mut session: Box<dyn Session>) -> SessionEnd {
        if let Role::Local { filter, .. } = &self.role {
            info!("{} broker: subscribing to {}", self.side, filter);
            let subscribe = session.subscribe(filter, QoS::AtMostOnce);
            match unless_cancelled(&self.token, subscribe).await {
                None => return SessionEnd::Shutdown,
                Some(Ok(_)) => {}
                Some(Err(e)) => warn!("{} broker: subscribe failed: {}", self.side, e),
            }
        }

        let mut keep_alive = self.endpoint.keep_alive_interval().map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut awaiting_ping = false;

        loop {
            let step = tokio::select! {
                biased;
                _ = self.token.cancelled() => Step::Shutdown,
                Some(command) = self.commands.recv() => Step::Command(command),
                event = session.poll() => Step::Event(event),
                _ = tick(&mut keep_alive) => Step::KeepAlive,
            };

            match step {
                Step::Shutdown => {
                    debug!("{} broker: disconnecting", self.side);
                    if timeout(DISCONNECT_TIMEOUT, session.disconnect()).await.is_err() {
                        debug!("{} broker: DISCONNECT timed out, dropping socket", self.side);
                    }
                    return SessionEnd::Shutdown;
                }
                Step::Command(Command::Publish {
                    topic,
                    payload,
                    reply,
                }) => {
                    let publish = session.publish(&topic, payload, self.role.publish_qos());
                    let Some(result) = unless_cancelled(&self.token, publish).await else {
                        // The write may be half done, so the session is not reused
                        let _ = reply.send(Err(PublishError::Closed));
                        return SessionEnd::Shutdown;
                    };
                    let lost = match &result {
                        Err(e) if e.is_connection_lost() => Some(e.to_string()),
                        _ => None,
                    };
                    let _ = reply.send(result);

                    if let Some(reason) = lost {
                        return SessionEnd::Lost(ConnectionError::Io(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            reason,
                        )));
                    }
                }
                Step::Event(Ok(event)) => self.handle_event(event, &mut awaiting_ping),
                Step::Event(Err(e)) => return SessionEnd::Lost(e),
                Step::KeepAlive => {
                    if awaiting_ping {
                        return SessionEnd::Lost(ConnectionError::KeepAliveTimeout);
                    }
                    match unless_cancelled(&self.token, session.ping()).await {
                        None => return SessionEnd::Shutdown,
                        Some(Err(e)) => return SessionEnd::Lost(e),
                        Some(Ok(())) => {}
                    }
                    trace!("{} broker: PINGREQ sent", self.side);
                    awaiting_ping = true;
                }
            }
        }
    }

    fn handle_event(&self, event: SessionEvent, awaiting_ping: &mut bool) {
        match event {
            SessionEvent::Message(message) => match &self.role {
                Role::Local { inbound, .. } => match inbound.try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Full(message)) => {
                        warn!(
                            "{} broker: forwarding queue full, dropping message on {}",
                            self.side, message.topic
                        );
                    }
                    Err(TrySendError::Closed(message)) => {
                        debug!(
                            "{} broker: forwarding stopped, dropping message on {}",
                            self.side, message.topic
                        );
                    }
                },
                Role::Remote { .. } => {
                    trace!("{} broker: ignoring message on {}", self.side, message.topic);
                }
            },
            SessionEvent::SubAck { packet_id, granted } => {
                let filter = match &self.role {
                    Role::Local { filter, .. } => filter.as_str(),
                    Role::Remote { .. } => "",
                };
                match granted {
                    Some(qos) => info!(
                        "{} broker: subscribed to {} (granted {:?}, packet {})",
                        self.side, filter, qos, packet_id
                    ),
                    None => warn!(
                        "{} broker: {}; connection stays up without inbound messages",
                        self.side,
                        SubscriptionError::Rejected(filter.to_string())
                    ),
                }
            }
            SessionEvent::PubAck { packet_id } => {
                debug!("{} broker: PUBACK {}", self.side, packet_id);
            }
            SessionEvent::PingResp => {
                debug!("{} broker: PINGRESP", self.side);
                *awaiting_ping = false;
            }
        }
    }
}

/// Next keep-alive tick, or never when keep-alive is disabled
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Drive `fut` unless shutdown comes first
async fn unless_cancelled<F: Future>(token: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        output = fut => Some(output),
    }
}
