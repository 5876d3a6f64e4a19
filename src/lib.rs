//! MQTT Forwarder - resilient local-to-remote MQTT bridge
//!
//! Subscribes to a topic filter on a local broker and republishes every
//! message on a remote broker under a topic prefix. Both connections
//! reconnect on their own with exponential backoff.

pub mod bridge;
pub mod client;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod topic;

pub use bridge::{Bridge, BackoffStrategy, ConnectionManager, ConnectionState, ForwardingPipeline};
pub use client::{Connector, Session, TcpConnector};
pub use config::{Config, ConfigError};
pub use protocol::QoS;
