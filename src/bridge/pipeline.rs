//! Local-to-remote forwarding

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::Publisher;
use crate::client::{InboundMessage, PublishError};

/// Topic on the remote broker for a local topic.
///
/// Plain concatenation: separators already present in either part are kept
/// as they are.
pub fn remote_topic(prefix: &str, topic: &str) -> String {
    format!("{}/{}", prefix, topic)
}

/// Result of forwarding one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    Forwarded {
        local_topic: String,
        remote_topic: String,
    },
    /// Remote side was not connected; the message is gone
    Dropped,
    /// The publish itself failed; the message is gone
    Failed(PublishError),
}

/// Forwarding counters, shared with whoever wants to report them
#[derive(Debug, Default)]
pub struct ForwardStats {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl ForwardStats {
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn record(&self, outcome: &ForwardOutcome) {
        let counter = match outcome {
            ForwardOutcome::Forwarded { .. } => &self.forwarded,
            ForwardOutcome::Dropped => &self.dropped,
            ForwardOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Couples the local side's messages to the remote side's publisher.
///
/// No buffering: a message that cannot be published right now is dropped.
#[derive(Debug)]
pub struct ForwardingPipeline {
    prefix: String,
    remote: Publisher,
    stats: Arc<ForwardStats>,
}

impl ForwardingPipeline {
    pub fn new(prefix: impl Into<String>, remote: Publisher, stats: Arc<ForwardStats>) -> Self {
        Self {
            prefix: prefix.into(),
            remote,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ForwardStats> {
        &self.stats
    }

    /// Forward one message to the remote broker
    pub async fn forward(&self, topic: &str, payload: Bytes) -> ForwardOutcome {
        let outcome = if !self.remote.is_connected() {
            warn!("Remote broker not connected, dropping message on {}", topic);
            ForwardOutcome::Dropped
        } else {
            let target = remote_topic(&self.prefix, topic);
            match self.remote.publish(target.clone(), payload).await {
                Ok(()) => {
                    info!("Forwarded message: {} -> {}", topic, target);
                    ForwardOutcome::Forwarded {
                        local_topic: topic.to_string(),
                        remote_topic: target,
                    }
                }
                // Lost the race against a disconnect
                Err(PublishError::NotConnected) => {
                    warn!("Remote broker not connected, dropping message on {}", topic);
                    ForwardOutcome::Dropped
                }
                Err(e) => {
                    warn!("Failed to forward {} -> {}: {}", topic, target, e);
                    ForwardOutcome::Failed(e)
                }
            }
        };

        self.stats.record(&outcome);
        outcome
    }

    /// Forward everything from `inbound` until cancelled or the sender closes
    pub async fn run(self, mut inbound: mpsc::Receiver<InboundMessage>, token: CancellationToken) {
        loop {
            let message = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.forward(&message.topic, message.payload).await;
        }

        debug!(
            "Forwarding stopped (forwarded={}, dropped={}, failed={})",
            self.stats.forwarded(),
            self.stats.dropped(),
            self.stats.failed()
        );
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test_case("bridge/siteA", "eu868/gateway/abc/event/up", "bridge/siteA/eu868/gateway/abc/event/up" ; "typical")]
    #[test_case("bridge/", "a/b", "bridge//a/b" ; "trailing separator kept")]
    #[test_case("bridge", "/a", "bridge//a" ; "leading separator kept")]
    #[test_case("p", "", "p/" ; "empty topic")]
    fn test_remote_topic(prefix: &str, topic: &str, expected: &str) {
        assert_eq!(remote_topic(prefix, topic), expected);
    }

    #[test]
    fn test_stats_record_each_outcome_once() {
        let stats = ForwardStats::default();
        stats.record(&ForwardOutcome::Dropped);
        stats.record(&ForwardOutcome::Dropped);
        stats.record(&ForwardOutcome::Failed(PublishError::QueueFull));
        stats.record(&ForwardOutcome::Forwarded {
            local_topic: "a".into(),
            remote_topic: "p/a".into(),
        });

        assert_eq!(stats.dropped(), 2);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.forwarded(), 1);
    }
}
