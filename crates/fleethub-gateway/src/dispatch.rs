//! Bounded dispatch queues and per-kind worker pools.
//!
//! Each operation kind owns one queue and one fixed-size worker pool,
//! instantiated from configuration. A kind's queue is split into one bounded
//! lane per worker; an item's lane is chosen by hashing its node name, so
//! messages from one node for one kind are processed in arrival order while
//! distinct nodes proceed in parallel. No lock spans multiple kinds.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use fleethub_core::{Ack, Frame, MessageId, NodeId, OpKind};

use crate::config::DispatchConfig;
use crate::metrics::Metrics;
use crate::registry::SessionRegistry;
use crate::upstream::ClusterError;

/// Bounded wait for queue capacity before failing with `QueueFull`.
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal failure after this many collaborator attempts.
pub const RETRY_ATTEMPTS: u32 = 3;

/// First retry backoff; doubles per attempt.
pub const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(200);

/// A unit of work produced by the router and consumed by exactly one worker.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Originating node.
    pub node: NodeId,

    /// Operation kind; determines the queue.
    pub kind: OpKind,

    /// Id of the edge message, echoed in acks.
    pub message_id: MessageId,

    /// Operation payload.
    pub payload: Value,

    /// When the router enqueued the item.
    pub enqueued_at: DateTime<Utc>,
}

/// Dispatch errors observed by producers.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Queue stayed full past the bounded wait.
    #[error("dispatch queue for {0} is full")]
    QueueFull(OpKind),

    /// Queue is shut down.
    #[error("dispatch queue for {0} is closed")]
    QueueClosed(OpKind),
}

/// Processes one work item against the cluster manager.
#[async_trait::async_trait]
pub trait WorkProcessor: Send + Sync {
    /// Perform the operation. Query kinds return a response body.
    async fn process(&self, item: &WorkItem) -> Result<Option<Value>, ClusterError>;
}

/// One kind's bounded queue: a lane per worker.
struct DispatchQueue {
    kind: OpKind,
    lanes: Vec<mpsc::Sender<WorkItem>>,
}

impl DispatchQueue {
    fn lane_for(&self, node: &NodeId) -> &mpsc::Sender<WorkItem> {
        let mut hasher = DefaultHasher::new();
        node.as_str().hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.lanes.len();
        &self.lanes[idx]
    }
}

/// All dispatch queues and their worker pools.
///
/// Dropping the dispatcher closes every lane; workers finish their buffered
/// items and exit, which is the graceful-drain path on shutdown.
pub struct Dispatcher {
    queues: HashMap<OpKind, DispatchQueue>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    /// Instantiate one queue + worker pool per operation kind and start the
    /// workers.
    pub fn start(
        config: &DispatchConfig,
        processor: Arc<dyn WorkProcessor>,
        registry: Arc<SessionRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut queues = HashMap::new();

        for kind in OpKind::ALL {
            let tuning = config.tuning(kind);
            let workers = tuning.workers.max(1);
            // Lane capacities sum to the configured queue capacity.
            let lane_capacity = tuning.capacity.div_ceil(workers).max(1);

            let mut lanes = Vec::with_capacity(workers);
            for lane_idx in 0..workers {
                let (tx, rx) = mpsc::channel::<WorkItem>(lane_capacity);
                lanes.push(tx);

                tokio::spawn(run_worker(
                    kind,
                    lane_idx,
                    rx,
                    processor.clone(),
                    registry.clone(),
                    metrics.clone(),
                ));
            }

            debug!(
                op = %kind,
                workers,
                capacity = tuning.capacity,
                "Dispatch queue started"
            );

            queues.insert(kind, DispatchQueue { kind, lanes });
        }

        Self { queues, metrics }
    }

    /// Enqueue a work item on its kind's queue.
    ///
    /// Blocks up to [`ENQUEUE_TIMEOUT`] when the lane is full, then fails
    /// with `QueueFull`. The item is never dropped silently and never
    /// duplicated: either this returns `Ok` and exactly one worker consumes
    /// it, or it returns an error and the item was not queued.
    pub async fn enqueue(&self, item: WorkItem) -> Result<(), DispatchError> {
        let kind = item.kind;
        // Router classification guarantees the queue exists for every kind.
        let queue = self
            .queues
            .get(&kind)
            .ok_or(DispatchError::QueueClosed(kind))?;

        let lane = queue.lane_for(&item.node);
        match lane.send_timeout(item, ENQUEUE_TIMEOUT).await {
            Ok(()) => {
                self.metrics.inc_depth(kind);
                Ok(())
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(op = %queue.kind, "Dispatch queue full");
                Err(DispatchError::QueueFull(kind))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                Err(DispatchError::QueueClosed(kind))
            }
        }
    }

    /// Current pending depth of one kind's queue.
    pub fn queue_depth(&self, kind: OpKind) -> usize {
        self.metrics.depth(kind)
    }
}

/// A single worker: pull, process with bounded retry, acknowledge.
async fn run_worker(
    kind: OpKind,
    lane_idx: usize,
    mut rx: mpsc::Receiver<WorkItem>,
    processor: Arc<dyn WorkProcessor>,
    registry: Arc<SessionRegistry>,
    metrics: Arc<Metrics>,
) {
    while let Some(item) = rx.recv().await {
        metrics.dec_depth(kind);
        process_item(&item, processor.as_ref(), &registry, &metrics).await;
    }

    debug!(op = %kind, lane = lane_idx, "Dispatch worker drained and stopped");
}

/// Process one item: bounded retry with doubling backoff, then a terminal
/// result acknowledged back to the originating node when its session is
/// still live.
async fn process_item(
    item: &WorkItem,
    processor: &dyn WorkProcessor,
    registry: &Arc<SessionRegistry>,
    metrics: &Arc<Metrics>,
) {
    let mut attempt = 0;
    loop {
        match processor.process(item).await {
            Ok(body) => {
                metrics.items_processed.fetch_add(1, Ordering::Relaxed);
                let ack = match body {
                    Some(body) if item.kind.is_query() => {
                        Ack::ok_with_body(item.message_id.clone(), body)
                    }
                    _ => Ack::ok(item.message_id.clone()),
                };
                deliver_ack(registry, &item.node, ack).await;
                return;
            }
            Err(err) => {
                attempt += 1;
                if attempt >= RETRY_ATTEMPTS {
                    metrics.items_failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        node = %item.node,
                        op = %item.kind,
                        message_id = %item.message_id,
                        error = %err,
                        attempts = attempt,
                        "Work item failed terminally"
                    );
                    deliver_ack(
                        registry,
                        &item.node,
                        Ack::failure(item.message_id.clone(), err.to_string()),
                    )
                    .await;
                    return;
                }

                metrics.items_retried.fetch_add(1, Ordering::Relaxed);
                let backoff = RETRY_BACKOFF_BASE * 2u32.pow(attempt - 1);
                info!(
                    node = %item.node,
                    op = %item.kind,
                    error = %err,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "Collaborator call failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Acknowledge a terminal result. A node that disconnected after enqueueing
/// has no ack channel; the result is already logged, so this is best-effort.
async fn deliver_ack(registry: &Arc<SessionRegistry>, node: &NodeId, ack: Ack) {
    if let Err(e) = registry.send_to_node(node, Frame::Ack(ack)).await {
        debug!(node = %node, error = %e, "Ack not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleethub_core::QueueTuning;
    use serde_json::json;
    use std::time::Duration as StdDuration;
    use tokio::sync::{Mutex, Semaphore};

    /// Processor that records processed items, optionally gated on a
    /// semaphore permit per item.
    struct RecordingProcessor {
        gate: Option<Arc<Semaphore>>,
        seen: Arc<Mutex<Vec<(NodeId, Value)>>>,
        fail_times: u32,
        failures_seen: Arc<Mutex<HashMap<String, u32>>>,
    }

    impl RecordingProcessor {
        fn new() -> (Arc<Self>, Arc<Mutex<Vec<(NodeId, Value)>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Arc::new(Self {
                    gate: None,
                    seen: seen.clone(),
                    fail_times: 0,
                    failures_seen: Arc::new(Mutex::new(HashMap::new())),
                }),
                seen,
            )
        }

        fn gated(gate: Arc<Semaphore>) -> (Arc<Self>, Arc<Mutex<Vec<(NodeId, Value)>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Arc::new(Self {
                    gate: Some(gate),
                    seen: seen.clone(),
                    fail_times: 0,
                    failures_seen: Arc::new(Mutex::new(HashMap::new())),
                }),
                seen,
            )
        }

        fn failing(times: u32) -> (Arc<Self>, Arc<Mutex<Vec<(NodeId, Value)>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Arc::new(Self {
                    gate: None,
                    seen: seen.clone(),
                    fail_times: times,
                    failures_seen: Arc::new(Mutex::new(HashMap::new())),
                }),
                seen,
            )
        }
    }

    #[async_trait::async_trait]
    impl WorkProcessor for RecordingProcessor {
        async fn process(&self, item: &WorkItem) -> Result<Option<Value>, ClusterError> {
            if let Some(gate) = &self.gate {
                let permit = gate.acquire().await.unwrap();
                permit.forget();
            }

            if self.fail_times > 0 {
                let mut failures = self.failures_seen.lock().await;
                let count = failures.entry(item.message_id.to_string()).or_insert(0);
                if *count < self.fail_times {
                    *count += 1;
                    return Err(ClusterError::Unavailable("injected".to_string()));
                }
            }

            self.seen
                .lock()
                .await
                .push((item.node.clone(), item.payload.clone()));
            Ok(None)
        }
    }

    fn item(node: &str, kind: OpKind, n: u64) -> WorkItem {
        WorkItem {
            node: NodeId::new(node),
            kind,
            message_id: MessageId::generate(),
            payload: json!({ "n": n }),
            enqueued_at: Utc::now(),
        }
    }

    fn lease_config(capacity: usize, workers: usize) -> DispatchConfig {
        let mut config = DispatchConfig::default();
        config
            .overrides
            .insert(OpKind::CreateLease, QueueTuning { capacity, workers });
        config
    }

    fn test_registry() -> Arc<SessionRegistry> {
        SessionRegistry::new(16, StdDuration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_blocks_then_fails_queue_full() {
        let gate = Arc::new(Semaphore::new(0));
        let (processor, seen) = RecordingProcessor::gated(gate.clone());
        let metrics = Metrics::new();
        let dispatcher = Dispatcher::start(
            &lease_config(1, 1),
            processor,
            test_registry(),
            metrics.clone(),
        );

        // First item: buffered, then immediately pulled by the (gated) worker.
        dispatcher
            .enqueue(item("edge-1", OpKind::CreateLease, 1))
            .await
            .unwrap();
        tokio::task::yield_now().await;

        // Second item fills the lane while the worker is busy.
        dispatcher
            .enqueue(item("edge-1", OpKind::CreateLease, 2))
            .await
            .unwrap();

        // Third item cannot fit: blocks for ENQUEUE_TIMEOUT, then QueueFull.
        let err = dispatcher
            .enqueue(item("edge-1", OpKind::CreateLease, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::QueueFull(OpKind::CreateLease)));

        // Release the worker: exactly the two accepted items run, in order.
        gate.add_permits(2);
        loop {
            tokio::task::yield_now().await;
            if seen.lock().await.len() == 2 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        let seen = seen.lock().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, json!({"n": 1}));
        assert_eq!(seen[1].1, json!({"n": 2}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_enqueue_waits_for_dequeue_at_capacity_one() {
        let gate = Arc::new(Semaphore::new(0));
        let (processor, _seen) = RecordingProcessor::gated(gate.clone());
        let dispatcher = Arc::new(Dispatcher::start(
            &lease_config(1, 1),
            processor,
            test_registry(),
            Metrics::new(),
        ));

        // Worker grabs item 1 and parks in the processor; item 2 fills the lane.
        dispatcher
            .enqueue(item("edge-1", OpKind::CreateLease, 1))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        dispatcher
            .enqueue(item("edge-1", OpKind::CreateLease, 2))
            .await
            .unwrap();

        // Item 3 must wait until item 2 is dequeued.
        let d = dispatcher.clone();
        let pending = tokio::spawn(async move {
            d.enqueue(item("edge-1", OpKind::CreateLease, 3)).await
        });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        // Let item 1 finish; the worker dequeues item 2 and the blocked
        // enqueue completes.
        gate.add_permits(1);
        let result = pending.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_same_node_same_kind_processed_in_order() {
        let (processor, seen) = RecordingProcessor::new();
        let dispatcher = Dispatcher::start(
            &lease_config(1024, 4),
            processor,
            test_registry(),
            Metrics::new(),
        );

        for n in 0..50u64 {
            dispatcher
                .enqueue(item("edge-a", OpKind::CreateLease, n))
                .await
                .unwrap();
            dispatcher
                .enqueue(item("edge-b", OpKind::CreateLease, n))
                .await
                .unwrap();
        }

        // Wait for all 100 items to drain.
        for _ in 0..200 {
            if seen.lock().await.len() == 100 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 100);
        for node in ["edge-a", "edge-b"] {
            let order: Vec<u64> = seen
                .iter()
                .filter(|(n, _)| n.as_str() == node)
                .map(|(_, payload)| payload["n"].as_u64().unwrap())
                .collect();
            let expected: Vec<u64> = (0..50).collect();
            assert_eq!(order, expected, "per-node FIFO violated for {node}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries_then_succeeds() {
        let (processor, seen) = RecordingProcessor::failing(2);
        let metrics = Metrics::new();
        let dispatcher = Dispatcher::start(
            &lease_config(16, 1),
            processor,
            test_registry(),
            metrics.clone(),
        );

        dispatcher
            .enqueue(item("edge-1", OpKind::CreateLease, 1))
            .await
            .unwrap();

        for _ in 0..100 {
            if seen.lock().await.len() == 1 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }
        assert_eq!(seen.lock().await.len(), 1);
        assert_eq!(metrics.items_retried.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.items_processed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.items_failed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_is_terminal_and_acked() {
        let (processor, seen) = RecordingProcessor::failing(u32::MAX);
        let metrics = Metrics::new();
        let registry = test_registry();
        let dispatcher = Dispatcher::start(
            &lease_config(16, 1),
            processor,
            registry.clone(),
            metrics.clone(),
        );

        // Give the node a live session so the failure ack has a channel.
        let (tx, mut rx) = mpsc::channel(4);
        registry
            .admit(
                NodeId::new("edge-1"),
                fleethub_core::TransportKind::WebSocket,
                String::new(),
                tx,
            )
            .await
            .unwrap();

        let failing = item("edge-1", OpKind::CreateLease, 1);
        let message_id = failing.message_id.clone();
        dispatcher.enqueue(failing).await.unwrap();

        for _ in 0..100 {
            if metrics.items_failed.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }

        assert!(seen.lock().await.is_empty());
        assert_eq!(metrics.items_failed.load(Ordering::Relaxed), 1);

        match rx.recv().await {
            Some(Frame::Ack(ack)) => {
                assert_eq!(ack.ref_id, message_id);
                assert!(!ack.success);
                assert!(ack.error.is_some());
            }
            other => panic!("expected failure ack, got {:?}", other),
        }
    }
}
