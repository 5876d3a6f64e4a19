//! Bridge Module
//!
//! Relays messages from a local broker to a remote broker under a topic
//! prefix. Each broker connection has its own [`ConnectionManager`] with its
//! own reconnect backoff, so an outage on one side never stalls the other.
//! The [`ForwardingPipeline`] is the only link between them.
//!
//! ```text
//! local broker -> ConnectionManager(Local) -> ForwardingPipeline
//!              -> ConnectionManager(Remote) -> remote broker
//! ```

mod backoff;
mod connection;
mod pipeline;


use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{Connector, InboundMessage, TcpConnector};
use crate::config::{Config, ConfigError};

pub use backoff::BackoffStrategy;
pub use connection::{ConnectionManager, ConnectionState, Publisher, Role, Side};
pub use pipeline::{remote_topic, ForwardOutcome, ForwardStats, ForwardingPipeline};

/// Capacity of the queue between the local side and the pipeline
const INBOUND_QUEUE_SIZE: usize = 1000;

/// Top-level composition of both connections and the pipeline
pub struct Bridge {
    token: CancellationToken,
    local: ConnectionManager,
    remote: ConnectionManager,
    pipeline: Option<(ForwardingPipeline, mpsc::Receiver<InboundMessage>)>,
    pipeline_handle: Option<JoinHandle<()>>,
    stats: Arc<ForwardStats>,
}

impl Bridge {
    /// Bridge over plain TCP connections
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        Self::with_connector(config, Arc::new(TcpConnector::new()))
    }

    /// Bridge over the given client implementation
    pub fn with_connector(
        config: Config,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let local_endpoint = config.local_endpoint()?;
        let remote_endpoint = config.remote_endpoint()?;

        let token = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);

        let backoff = || {
            BackoffStrategy::new(
                config.reconnect.initial_delay(),
                config.reconnect.max_delay(),
            )
        };

        let local = ConnectionManager::new(
            Role::Local {
                filter: config.local.topic.clone(),
                inbound: inbound_tx,
            },
            local_endpoint,
            backoff(),
            connector.clone(),
            token.child_token(),
        );
        let remote = ConnectionManager::new(
            Role::Remote {
                qos: config.remote.publish_qos(),
            },
            remote_endpoint,
            backoff(),
            connector,
            token.child_token(),
        );

        let stats = Arc::new(ForwardStats::default());
        let pipeline = ForwardingPipeline::new(
            config.remote.topic_prefix.clone(),
            remote.publisher(),
            stats.clone(),
        );

        Ok(Self {
            token,
            local,
            remote,
            pipeline: Some((pipeline, inbound_rx)),
            pipeline_handle: None,
            stats,
        })
    }

    /// Start forwarding and both connection lifecycles. Later calls do nothing.
    pub fn start(&mut self) {
        let Some((pipeline, inbound)) = self.pipeline.take() else {
            return;
        };

        info!("Starting bridge");
        self.pipeline_handle = Some(tokio::spawn(pipeline.run(inbound, self.token.clone())));
        self.local.start();
        self.remote.start();
    }

    /// Disconnect both sides and stop forwarding.
    ///
    /// Returns after both connections are closed and no reconnect can follow.
    pub async fn shutdown(&mut self) {
        if self.token.is_cancelled() && self.pipeline_handle.is_none() {
            return;
        }

        info!("Shutting down bridge");
        self.token.cancel();
        self.pipeline = None;

        self.local.stop().await;
        self.remote.stop().await;

        if let Some(handle) = self.pipeline_handle.take() {
            if let Err(e) = handle.await {
                warn!("Forwarding task failed: {}", e);
            }
        }

        info!(
            "Bridge stopped (forwarded={}, dropped={}, failed={})",
            self.stats.forwarded(),
            self.stats.dropped(),
            self.stats.failed()
        );
    }

    pub fn local_state(&self) -> ConnectionState {
        self.local.state()
    }

    pub fn remote_state(&self) -> ConnectionState {
        self.remote.state()
    }

    pub fn local(&self) -> &ConnectionManager {
        &self.local
    }

    pub fn remote(&self) -> &ConnectionManager {
        &self.remote
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        self.stats.clone()
    }

    /// Token cancelled when shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }
}
