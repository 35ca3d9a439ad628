//! Message router: classifies inbound messages and feeds dispatch queues.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use fleethub_core::{EdgeMessage, OpKind};

use crate::dispatch::{DispatchError, Dispatcher, WorkItem};
use crate::metrics::Metrics;

/// Routing errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Message names a kind outside the enumerable set; protocol skew,
    /// never routed to a default queue.
    #[error("unknown operation kind: {0}")]
    UnknownOpKind(String),

    /// Backpressure or shutdown surfaced by the dispatch queue.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Classifies messages by operation kind and enqueues work items.
pub struct MessageRouter {
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
}

impl MessageRouter {
    /// Create a router over the started dispatcher.
    pub fn new(dispatcher: Arc<Dispatcher>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            metrics,
        })
    }

    /// Route one message to its kind's queue.
    ///
    /// Awaiting this call is the backpressure point: a full queue holds the
    /// caller (pausing that connection's read loop) until capacity frees or
    /// the bounded wait elapses.
    pub async fn route(&self, message: EdgeMessage) -> Result<(), RouterError> {
        let kind = match OpKind::parse(&message.op) {
            Ok(kind) => kind,
            Err(_) => {
                self.metrics.messages_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(node = %message.node, op = %message.op, "Rejecting unknown operation kind");
                return Err(RouterError::UnknownOpKind(message.op));
            }
        };

        let item = WorkItem {
            node: message.node,
            kind,
            message_id: message.id,
            payload: message.payload,
            enqueued_at: Utc::now(),
        };

        self.dispatcher.enqueue(item).await.map_err(|e| {
            self.metrics.messages_rejected.fetch_add(1, Ordering::Relaxed);
            e.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatch::WorkProcessor;
    use crate::registry::SessionRegistry;
    use crate::upstream::ClusterError;
    use fleethub_core::NodeId;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct CountingProcessor {
        seen: Arc<Mutex<Vec<OpKind>>>,
    }

    #[async_trait::async_trait]
    impl WorkProcessor for CountingProcessor {
        async fn process(&self, item: &WorkItem) -> Result<Option<Value>, ClusterError> {
            self.seen.lock().await.push(item.kind);
            Ok(None)
        }
    }

    fn router() -> (Arc<MessageRouter>, Arc<Mutex<Vec<OpKind>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let metrics = Metrics::new();
        let registry = SessionRegistry::new(16, Duration::from_millis(100));
        let dispatcher = Arc::new(Dispatcher::start(
            &DispatchConfig::default(),
            Arc::new(CountingProcessor { seen: seen.clone() }),
            registry,
            metrics.clone(),
        ));
        (MessageRouter::new(dispatcher, metrics), seen)
    }

    #[tokio::test]
    async fn test_unknown_op_kind_is_rejected() {
        let (router, seen) = router();

        let mut message = EdgeMessage::new(NodeId::new("edge-1"), OpKind::CreateLease, json!({}));
        message.op = "launch_missiles".to_string();

        let err = router.route(message).await.unwrap_err();
        assert!(matches!(err, RouterError::UnknownOpKind(_)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_known_op_kind_reaches_a_worker() {
        let (router, seen) = router();

        let message = EdgeMessage::new(
            NodeId::new("edge-1"),
            OpKind::UpdatePodStatus,
            json!({"name": "nginx"}),
        );
        router.route(message).await.unwrap();

        for _ in 0..100 {
            if !seen.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*seen.lock().await, vec![OpKind::UpdatePodStatus]);
    }
}
