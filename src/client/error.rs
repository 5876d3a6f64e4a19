//! Client error types

use std::fmt;
use std::io;

use crate::protocol::{ConnectReturnCode, DecodeError, EncodeError};

/// Failure to establish or keep a broker connection.
///
/// Always recovered by the connection manager through a scheduled reconnect.
#[derive(Debug)]
pub enum ConnectionError {
    /// Socket error
    Io(io::Error),
    /// The broker closed the connection
    Closed,
    /// TCP connect or CONNACK did not complete in time
    Timeout,
    /// The broker refused the CONNECT
    Rejected(ConnectReturnCode),
    /// The broker sent something we could not decode or did not expect
    Protocol(String),
    /// No PINGRESP within one keep-alive interval
    KeepAliveTimeout,
    /// The endpoint could not be resolved into an address
    InvalidEndpoint(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "I/O error: {}", e),
            ConnectionError::Closed => write!(f, "connection closed by broker"),
            ConnectionError::Timeout => write!(f, "connection timed out"),
            ConnectionError::Rejected(code) => write!(f, "connection refused: {}", code),
            ConnectionError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            ConnectionError::KeepAliveTimeout => write!(f, "keep-alive timeout"),
            ConnectionError::InvalidEndpoint(msg) => write!(f, "invalid endpoint: {}", msg),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Protocol(e.to_string())
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Protocol(e.to_string())
    }
}

/// Failure of a subscribe request.
///
/// The connection stays up; no messages arrive until the next reconnect.
#[derive(Debug)]
pub enum SubscriptionError {
    /// The broker answered SUBACK with a failure return code
    Rejected(String),
    /// Writing the SUBSCRIBE failed
    Io(io::Error),
    /// The SUBSCRIBE could not be encoded
    Encode(EncodeError),
}

impl fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionError::Rejected(filter) => {
                write!(f, "subscription to '{}' rejected by broker", filter)
            }
            SubscriptionError::Io(e) => write!(f, "I/O error: {}", e),
            SubscriptionError::Encode(e) => write!(f, "encode error: {}", e),
        }
    }
}

impl std::error::Error for SubscriptionError {}

impl From<io::Error> for SubscriptionError {
    fn from(e: io::Error) -> Self {
        SubscriptionError::Io(e)
    }
}

impl From<EncodeError> for SubscriptionError {
    fn from(e: EncodeError) -> Self {
        SubscriptionError::Encode(e)
    }
}

/// Failure of a single publish. The message is dropped, never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The target side is not in the Connected state
    NotConnected,
    /// The connection task is not keeping up with publish requests
    QueueFull,
    /// Writing to the socket failed; the session is being torn down
    ConnectionLost(String),
    /// The PUBLISH could not be encoded (e.g. topic too long)
    Encode(EncodeError),
    /// The connection task has stopped
    Closed,
}

impl PublishError {
    /// True when the failure means the session itself is gone
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, PublishError::ConnectionLost(_))
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::NotConnected => write!(f, "not connected"),
            PublishError::QueueFull => write!(f, "publish queue full"),
            PublishError::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            PublishError::Encode(e) => write!(f, "encode error: {}", e),
            PublishError::Closed => write!(f, "connection stopped"),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<io::Error> for PublishError {
    fn from(e: io::Error) -> Self {
        PublishError::ConnectionLost(e.to_string())
    }
}

impl From<EncodeError> for PublishError {
    fn from(e: EncodeError) -> Self {
        PublishError::Encode(e)
    }
}
